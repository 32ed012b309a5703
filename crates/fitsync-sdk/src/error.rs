use std::fmt;

/// 错误分类，决定同步引擎如何处理一次失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 传输层瞬时错误：退避重试
    TransientNetwork,
    /// 校验失败：永久失败，不自动重试
    Validation,
    /// 版本冲突：交给冲突解决器
    Conflict,
    /// 本地存储错误：对当前操作致命，队列本身继续可用
    Storage,
    /// 调用方使用错误等其他情况
    Other,
}

#[derive(Debug)]
pub enum FitsyncSDKError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    Database(String),
    Migration(String),
    /// 网络超时、连接断开、5xx 等
    TransientNetwork(String),
    Timeout(String),
    Validation(String),
    Conflict(String),
    InvalidArgument(String),
    InvalidOperation(String),
    NotFound(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
    Other(String),
}

impl fmt::Display for FitsyncSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitsyncSDKError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            FitsyncSDKError::JsonError(e) => write!(f, "JSON error: {}", e),
            FitsyncSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            FitsyncSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            FitsyncSDKError::IO(e) => write!(f, "IO error: {}", e),
            FitsyncSDKError::Database(e) => write!(f, "Database error: {}", e),
            FitsyncSDKError::Migration(e) => write!(f, "Migration error: {}", e),
            FitsyncSDKError::TransientNetwork(e) => write!(f, "Transient network error: {}", e),
            FitsyncSDKError::Timeout(e) => write!(f, "Timeout: {}", e),
            FitsyncSDKError::Validation(e) => write!(f, "Validation error: {}", e),
            FitsyncSDKError::Conflict(e) => write!(f, "Conflict: {}", e),
            FitsyncSDKError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            FitsyncSDKError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            FitsyncSDKError::NotFound(e) => write!(f, "Not found: {}", e),
            FitsyncSDKError::Config(e) => write!(f, "Config error: {}", e),
            FitsyncSDKError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            FitsyncSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            FitsyncSDKError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for FitsyncSDKError {}

impl From<rusqlite::Error> for FitsyncSDKError {
    fn from(error: rusqlite::Error) -> Self {
        FitsyncSDKError::SqliteError(error)
    }
}

impl From<serde_json::Error> for FitsyncSDKError {
    fn from(error: serde_json::Error) -> Self {
        FitsyncSDKError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for FitsyncSDKError {
    fn from(error: std::io::Error) -> Self {
        FitsyncSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for FitsyncSDKError {
    fn from(error: sled::Error) -> Self {
        FitsyncSDKError::KvStore(error.to_string())
    }
}

impl From<bincode::Error> for FitsyncSDKError {
    fn from(error: bincode::Error) -> Self {
        FitsyncSDKError::Serialization(error.to_string())
    }
}

impl FitsyncSDKError {
    /// 归类到同步引擎关心的四类错误
    pub fn class(&self) -> ErrorClass {
        match self {
            FitsyncSDKError::TransientNetwork(_) | FitsyncSDKError::Timeout(_) => {
                ErrorClass::TransientNetwork
            }
            FitsyncSDKError::Validation(_) => ErrorClass::Validation,
            FitsyncSDKError::Conflict(_) => ErrorClass::Conflict,
            FitsyncSDKError::SqliteError(_)
            | FitsyncSDKError::KvStore(_)
            | FitsyncSDKError::Database(_)
            | FitsyncSDKError::Migration(_)
            | FitsyncSDKError::IO(_) => ErrorClass::Storage,
            _ => ErrorClass::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientNetwork
    }

    pub fn is_storage(&self) -> bool {
        self.class() == ErrorClass::Storage
    }
}

pub type Result<T> = std::result::Result<T, FitsyncSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            FitsyncSDKError::TransientNetwork("reset".into()).class(),
            ErrorClass::TransientNetwork
        );
        assert_eq!(FitsyncSDKError::Timeout("30s".into()).class(), ErrorClass::TransientNetwork);
        assert_eq!(FitsyncSDKError::Validation("name".into()).class(), ErrorClass::Validation);
        assert_eq!(FitsyncSDKError::Database("locked".into()).class(), ErrorClass::Storage);
        assert!(!FitsyncSDKError::Validation("x".into()).is_retryable());
        assert!(FitsyncSDKError::KvStore("x".into()).is_storage());
    }

    #[test]
    fn test_display() {
        let err = FitsyncSDKError::NotFound("operation abc".into());
        assert_eq!(err.to_string(), "Not found: operation abc");
    }
}

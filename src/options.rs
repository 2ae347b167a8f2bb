use crate::protocol::MAX_FRAME_SIZE;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 28015;

/// Settings for opening a [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    /// Database for terms that do not name one.
    pub default_db: Option<String>,
    /// Largest response body accepted before the connection is considered broken.
    pub max_frame_size: usize,
    /// Size of each socket read performed by the reader thread.
    pub read_buffer_size: usize,
}

impl ConnectionOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_db(mut self, database: impl Into<String>) -> Self {
        self.default_db = Some(database.into());
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            default_db: None,
            max_frame_size: MAX_FRAME_SIZE,
            read_buffer_size: 8 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ConnectionOptions::default();
        assert_eq!(options.address(), "localhost:28015");
        assert_eq!(options.default_db, None);
        assert_eq!(options.max_frame_size, MAX_FRAME_SIZE);
    }

    #[test]
    fn builder() {
        let options = ConnectionOptions::new("10.0.0.2", 9000)
            .with_db("blog")
            .with_read_buffer_size(512);

        assert_eq!(options.address(), "10.0.0.2:9000");
        assert_eq!(options.default_db.as_deref(), Some("blog"));
        assert_eq!(options.read_buffer_size, 512);
    }
}

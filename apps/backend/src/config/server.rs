use db_infra::DbInfraError;

/// Listen address for the admin HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, DbInfraError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, DbInfraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("BACKEND_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match lookup("BACKEND_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                DbInfraError::config(format!("BACKEND_PORT must be a valid port number, got '{raw}'"))
            })?,
            None => 3001,
        };
        Ok(Self { host, port })
    }
}

use std::fmt;
use std::io;

/// Environment variable selecting the runtime environment.
const ENVIRONMENT_ENV_VAR: &str = "MOLT_ENVIRONMENT";

/// The runtime environment a migration runs in, selecting which
/// configuration overlay file is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Reads the environment from `MOLT_ENVIRONMENT`, defaulting to `Dev`.
    pub fn load() -> Result<Environment, io::Error> {
        match std::env::var(ENVIRONMENT_ENV_VAR) {
            Ok(value) => value.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown environment `{value}`"),
                )
            }),
            Err(_) => Ok(Environment::Dev),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Prod),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_environment_names() {
        assert_eq!("dev".parse(), Ok(Environment::Dev));
        assert_eq!("production".parse(), Ok(Environment::Prod));
        assert_eq!("Staging".parse(), Ok(Environment::Staging));
        assert!("qa".parse::<Environment>().is_err());
    }
}

use crate::Error;
use serde::Deserialize;
use std::path::Path;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub document: DocumentConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DocumentConfig {
    /// Value of the `name` attribute of the rewrite map to update.
    ///
    /// When absent the first rewrite map in the document is used.
    pub map: Option<String>,
    /// Copy the document to a `.bak` file before overwriting it.
    #[serde(default)]
    pub backup: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|error| Error::from_io(path.as_ref(), error))?;

        toml::from_str(&contents).map_err(|error| Error::Config(path.as_ref().to_path_buf(), error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml() {
        let example = r#"
[document]
map = "Redirects"
backup = true
        "#;

        let expected = Config {
            document: DocumentConfig {
                map: Some("Redirects".to_string()),
                backup: true,
            },
        };

        let parsed: Config = toml::from_str(example).unwrap();

        assert_eq!(parsed, expected);
    }

    #[test]
    fn parse_empty_toml() {
        let parsed: Config = toml::from_str("").unwrap();

        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn reject_unknown_fields() {
        assert!(toml::from_str::<Config>("[document]\nmaps = \"Redirects\"\n").is_err());
    }

    #[test]
    fn load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bred.toml");
        std::fs::write(&path, "[document]\nbackup = \"yes\"\n").unwrap();

        assert!(matches!(Config::load(&path), Err(Error::Config(_, _))));
    }
}

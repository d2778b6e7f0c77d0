//! Server configuration, deserialised from `config.toml` and `FORMROW_*`
//! environment variables.

use std::path::PathBuf;

use formrow_core::{ConfigError, form::{Form, FormConfig}};
use formrow_engine::EngineOptions;
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:       String,
  #[serde(default = "default_port")]
  pub port:       u16,
  #[serde(default = "default_store_path")]
  pub store_path: PathBuf,
  #[serde(default)]
  pub engine:     EngineOptions,
  #[serde(default)]
  pub forms:      Vec<FormConfig>,
}

fn default_host() -> String { "127.0.0.1".to_owned() }

fn default_port() -> u16 { 8080 }

fn default_store_path() -> PathBuf { PathBuf::from("~/.local/share/formrow/formrow.db") }

/// Environment overrides: `FORMROW_PORT`, `FORMROW_ENGINE__MAX_PAGE_SIZE`.
pub fn environment() -> config::Environment {
  config::Environment::with_prefix("FORMROW")
    .prefix_separator("_")
    .separator("__")
    .try_parsing(true)
}

impl ServerConfig {
  /// Validate every configured form. One malformed form or dedup rule fails
  /// the whole load.
  pub fn load_forms(&self) -> Result<Vec<Form>, ConfigError> {
    self.forms.iter().cloned().map(Form::try_from).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(toml: &str) -> ServerConfig {
    config::Config::builder()
      .add_source(config::File::from_str(toml, config::FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn empty_config_uses_defaults() {
    let cfg = parse("");
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.engine, EngineOptions::default());
    assert!(cfg.load_forms().unwrap().is_empty());
  }

  #[test]
  fn forms_and_rules_load() {
    let cfg = parse(
      r#"
      port = 9000

      [engine]
      max_page_size = 25

      [[forms]]
      form_key    = "lunch"
      destination = "Lunch Orders"
      fields      = ["NAME", "EMAIL"]

      [[forms.dedup_rules]]
      id      = "one-per-email"
      keys    = ["EMAIL"]
      message = { en = "Already ordered", fr = "Déjà commandé" }
      "#,
    );
    assert_eq!(cfg.engine.max_page_size, 25);
    let forms = cfg.load_forms().unwrap();
    assert_eq!(forms[0].rules[0].message.resolve("fr"), "Déjà commandé");
  }

  #[test]
  fn environment_overrides_the_file() {
    let vars = [("FORMROW_PORT", "9090"), ("FORMROW_ENGINE__MAX_PAGE_SIZE", "25")]
      .into_iter()
      .map(|(k, v)| (k.to_owned(), v.to_owned()))
      .collect();
    let cfg: ServerConfig = config::Config::builder()
      .add_source(config::File::from_str("port = 9000", config::FileFormat::Toml))
      .add_source(environment().source(Some(vars)))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap();
    assert_eq!(cfg.port, 9090);
    assert_eq!(cfg.engine.max_page_size, 25);
  }

  #[test]
  fn malformed_rule_fails_loading() {
    let cfg = parse(
      r#"
      [[forms]]
      form_key    = "lunch"
      destination = "Lunch Orders"
      fields      = ["NAME"]

      [[forms.dedup_rules]]
      id   = "bad"
      keys = ["PHONE"]
      "#,
    );
    assert!(matches!(cfg.load_forms(), Err(ConfigError::UnknownKey { .. })));
  }
}

//! Tests for configuration loading and validation

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::pipeline::{Language, PipelineRegistry};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ConfigLoader::from_str("").unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.execution.run_timeout, 10);
        assert_eq!(config.execution.compile_timeout, 30);
        assert!(config.languages.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.requests);
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
server:
  bind_addr: "0.0.0.0:8080"
  enable_cors: false
execution:
  workspace_root: /var/tmp/gcode
  run_timeout: 5
  max_output_bytes: 4096
languages:
  python:
    run:
      program: python
      args: ["{source}"]
  java:
    enabled: false
logging:
  level: debug
  requests: false
"#;
        let config = ConfigLoader::from_str(yaml).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert!(!config.server.enable_cors);
        assert_eq!(config.execution.run_timeout, 5);
        assert_eq!(config.execution.compile_timeout, 30);
        assert_eq!(config.execution.max_output_bytes, 4096);
        assert!(!config.logging.requests);

        let registry = PipelineRegistry::from_overrides(&config.languages).unwrap();
        assert_eq!(registry.get(Language::Python).unwrap().run.program, "python");
        assert!(registry.lookup("java").is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ConfigLoader::from_str("execution:\n  run_timeout: 0\n").is_err());
        assert!(ConfigLoader::from_str("server:\n  bind_addr: nowhere\n").is_err());
        assert!(ConfigLoader::from_str("logging:\n  level: loud\n").is_err());
        assert!(ConfigLoader::from_str("languages:\n  cobol:\n    enabled: true\n").is_err());
        assert!(ConfigLoader::from_str(
            "languages:\n  c:\n    compile:\n      program: \"\"\n"
        )
        .is_err());
    }

    #[test]
    fn test_malformed_yaml_is_a_parse_error() {
        let err = ConfigLoader::from_str("execution: [1, 2").unwrap_err();
        assert!(matches!(err, crate::errors::ConfigError::Parse(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "execution:\n  compile_timeout: 60").unwrap();

        let config = load_config(file.path()).await.unwrap();
        assert_eq!(config.execution.compile_timeout, 60);
    }

    #[tokio::test]
    async fn test_missing_file_reports_path() {
        let err = load_config("/definitely/not/here/gcode.yaml").await.unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here/gcode.yaml"));
    }
}

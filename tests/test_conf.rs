use redsocial_init::conf::{self, DatabaseConfig, HOST_VAR, PORT_VAR, URI_VAR};

const TEST_CONFIG_FILE: &str = "tests/data/config.test.yaml";

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn test_load_config() {
    let conf = conf::load_config_with(TEST_CONFIG_FILE, no_env).unwrap();
    let db_conf = DatabaseConfig::from_config(&conf).unwrap();

    assert_eq!(db_conf.host, "mongo");
    assert_eq!(db_conf.port, 27018);
    assert_eq!(db_conf.username.as_deref(), Some("mongoadmin"));
    assert_eq!(db_conf.auth_database.as_deref(), Some("admin"));
    assert_eq!(db_conf.server_selection_timeout().as_secs(), 2);
    // not in the file, so the default
    assert_eq!(db_conf.app_name, "redsocial-init");
    assert_eq!(db_conf.uri(), "mongodb://mongo:27018");

    let credential = db_conf.credential().unwrap();
    assert_eq!(credential.username.as_deref(), Some("mongoadmin"));
    // left to the driver, so the root user in `admin` authenticates
    assert_eq!(credential.source, None);

    // the password never shows up in debug output
    assert!(!format!("{:?}", db_conf).contains("mongoadminsecret"));
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let conf = conf::load_config_with("tests/data/does-not-exist.yaml", no_env).unwrap();
    let db_conf = DatabaseConfig::from_config(&conf).unwrap();
    assert_eq!(db_conf, DatabaseConfig::default());
    assert_eq!(db_conf.auth_database, None);
    assert_eq!(db_conf.uri(), "mongodb://localhost:27017");
    assert!(db_conf.credential().is_none());
}

#[test]
fn test_environment_overrides() {
    let conf = conf::load_config_with(TEST_CONFIG_FILE, |name| match name {
        HOST_VAR => Some("db.internal".to_string()),
        PORT_VAR => Some("27100".to_string()),
        _ => None,
    })
    .unwrap();
    let db_conf = DatabaseConfig::from_config(&conf).unwrap();
    assert_eq!(db_conf.uri(), "mongodb://db.internal:27100");

    let conf = conf::load_config_with(TEST_CONFIG_FILE, |name| match name {
        URI_VAR => Some("mongodb://replica-a:27017,replica-b:27017/?replicaSet=rs0".to_string()),
        HOST_VAR => Some("ignored".to_string()),
        _ => None,
    })
    .unwrap();
    let db_conf = DatabaseConfig::from_config(&conf).unwrap();
    assert_eq!(
        db_conf.uri(),
        "mongodb://replica-a:27017,replica-b:27017/?replicaSet=rs0"
    );
}

#[test]
fn test_empty_environment_values_are_ignored() {
    let conf = conf::load_config_with(TEST_CONFIG_FILE, |name| match name {
        HOST_VAR | URI_VAR => Some(String::new()),
        _ => None,
    })
    .unwrap();
    let db_conf = DatabaseConfig::from_config(&conf).unwrap();
    assert_eq!(db_conf.uri(), "mongodb://mongo:27018");
}

#[test]
fn test_config_from_temp_file() {
    use std::io::Write;

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "db:\n  port: 28017\n  app_name: bootstrap").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let conf = conf::load_config_with(&path, no_env).unwrap();
    let db_conf = DatabaseConfig::from_config(&conf).unwrap();
    assert_eq!(db_conf.port, 28017);
    assert_eq!(db_conf.app_name, "bootstrap");
    assert_eq!(db_conf.host, "localhost");
}

#[test]
fn test_invalid_port_is_an_error() {
    let conf = conf::load_config_with(TEST_CONFIG_FILE, |name| match name {
        PORT_VAR => Some("not-a-port".to_string()),
        _ => None,
    })
    .unwrap();
    assert!(DatabaseConfig::from_config(&conf).is_err());
}

#[tokio::test]
async fn test_build_client() {
    let conf = conf::load_config_with(TEST_CONFIG_FILE, no_env).unwrap();
    let db_conf = DatabaseConfig::from_config(&conf).unwrap();
    // the driver connects lazily, so no server is needed here
    assert!(conf::build_client(&db_conf).await.is_ok());

    let broken = DatabaseConfig {
        uri: Some("not-a-connection-string".to_string()),
        ..DatabaseConfig::default()
    };
    assert!(conf::build_client(&broken).await.is_err());
}

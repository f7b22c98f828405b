use crate::config::read_env_or_file;
use std::env;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_reset_token_from_env_or_file() {
    // Direct variable wins.
    env::set_var("GRID_TEST_TOKEN", "direct_value");
    assert_eq!(read_env_or_file("GRID_TEST_TOKEN").unwrap(), "direct_value");
    env::remove_var("GRID_TEST_TOKEN");

    // File variable, trailing newline stripped.
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "file_value").unwrap();
    env::set_var("GRID_TEST_TOKEN_FILE", file.path().to_str().unwrap());
    assert_eq!(read_env_or_file("GRID_TEST_TOKEN").unwrap(), "file_value");
    env::remove_var("GRID_TEST_TOKEN_FILE");

    assert!(read_env_or_file("GRID_TEST_TOKEN").is_err());
}

#[test]
fn test_unreadable_secret_file_is_error() {
    env::set_var("GRID_MISSING_SECRET_FILE", "/nonexistent/secret");
    assert!(read_env_or_file("GRID_MISSING_SECRET").is_err());
    env::remove_var("GRID_MISSING_SECRET_FILE");
}

use agent_loopd::daemon::app_error_to_rpc;
use agent_loopd::errors::ErrorCategory;
use agent_loopd::ipc::protocol::INTERNAL_ERROR;
use agent_loopd::AppError;

#[test]
fn display_includes_variant_prefix() {
    assert_eq!(AppError::Config("bad".into()).to_string(), "config: bad");
    assert_eq!(AppError::NotFound("x".into()).to_string(), "not found: x");
    assert_eq!(
        AppError::SessionAlreadyRunning("build".into()).to_string(),
        "session already running for task 'build'"
    );
}

#[test]
fn categories_cover_every_variant() {
    let cases = [
        (AppError::Config(String::new()), ErrorCategory::Configuration),
        (AppError::Multiplexer(String::new()), ErrorCategory::Configuration),
        (AppError::Http(String::new()), ErrorCategory::TransientNetwork),
        (AppError::Overlay(String::new()), ErrorCategory::TransientNetwork),
        (AppError::Ipc(String::new()), ErrorCategory::TransientNetwork),
        (AppError::Io(String::new()), ErrorCategory::TransientNetwork),
        (AppError::SessionAlreadyRunning(String::new()), ErrorCategory::StateConflict),
        (AppError::AlreadyExists(String::new()), ErrorCategory::StateConflict),
        (AppError::Protocol(String::new()), ErrorCategory::Protocol),
        (AppError::NoPortsAvailable(String::new()), ErrorCategory::ResourceExhausted),
        (AppError::ServerStart(String::new()), ErrorCategory::ProcessFailure),
        (AppError::ServerHealthCheck(String::new()), ErrorCategory::ProcessFailure),
        (AppError::Session(String::new()), ErrorCategory::ProcessFailure),
        (AppError::Db(String::new()), ErrorCategory::Storage),
        (AppError::NotFound(String::new()), ErrorCategory::NotFound),
    ];
    for (err, expected) in cases {
        assert_eq!(err.category(), expected, "{err}");
    }
}

#[test]
fn only_transient_network_errors_are_retryable() {
    assert!(AppError::Http("refused".into()).is_retryable());
    assert!(AppError::Overlay("dial".into()).is_retryable());
    assert!(!AppError::Config("identity".into()).is_retryable());
    assert!(!AppError::NoPortsAvailable("4096-4096".into()).is_retryable());
    assert!(!AppError::SessionAlreadyRunning("t".into()).is_retryable());
}

#[test]
fn conversions_map_to_expected_variants() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    assert!(matches!(AppError::from(io), AppError::Io(_)));

    let json = serde_json::from_str::<serde_json::Value>("{").expect_err("bad json");
    assert!(matches!(AppError::from(json), AppError::Protocol(_)));

    let toml = toml::from_str::<toml::Table>("a = ").expect_err("bad toml");
    assert!(matches!(AppError::from(toml), AppError::Config(_)));
}

#[test]
fn rpc_error_carries_category() {
    let rpc = app_error_to_rpc(&AppError::SessionAlreadyRunning("build".into()));
    assert_eq!(rpc.code, INTERNAL_ERROR);
    assert!(rpc.message.contains("build"));
    assert_eq!(
        rpc.data.expect("category data")["category"],
        "StateConflict"
    );
}

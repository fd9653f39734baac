use notification_dispatch::{Config, DebounceConfig, RetryPolicy, config::DelayStrategy};
use tokio_test::{assert_err, assert_ok};

fn from_vars(vars: &[(&str, &str)]) -> Config {
    envy::from_iter(
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string())),
    )
    .unwrap()
}

/// Test: Only the broker URI is required
#[test]
fn test_defaults() {
    let config = from_vars(&[("BROKER_URI", "amqp://localhost:5672/%2f")]);

    assert_eq!(config.broker_name_prefix, "");
    assert_eq!(config.broker_delay_strategy, DelayStrategy::Ttl);
    assert_eq!(config.broker_publisher_channels, 4);
    assert_eq!(config.retry_policy(), RetryPolicy::default());
    assert_eq!(config.debounce_config(), DebounceConfig::default());
    assert_eq!(config.shutdown_grace().as_millis(), 10_000);
    assert_eq!(config.publish_confirm_timeout().as_millis(), 5000);
    assert_eq!(config.server_port, 8080);
    assert_ok!(config.validate());
}

/// Test: Environment variables override the defaults
#[test]
fn test_overrides() {
    let config = from_vars(&[
        ("BROKER_URI", "amqp://localhost:5672/%2f"),
        ("BROKER_NAME_PREFIX", "billing."),
        ("BROKER_DELAY_STRATEGY", "plugin"),
        ("RETRY_MAX_ATTEMPTS", "5"),
        ("RETRY_MULTIPLIER", "1.5"),
        ("DEBOUNCE_DEFAULT_WAIT_FOR_MS", "250"),
    ]);

    assert_eq!(config.broker_name_prefix, "billing.");
    assert_eq!(config.broker_delay_strategy, DelayStrategy::Plugin);
    assert_eq!(config.retry_policy().max_attempts, 5);
    assert_eq!(config.retry_policy().multiplier, 1.5);
    assert_eq!(config.debounce_config().wait_for_ms, 250);
    assert_ok!(config.validate());
}

/// Test: Missing broker URI is an error
#[test]
fn test_missing_uri() {
    assert_err!(envy::from_iter::<_, Config>(Vec::<(String, String)>::new()));
}

/// Test: Prefixes must end with the separator
#[test]
fn test_prefix_without_separator_rejected() {
    let mut config = Config::with_uri("amqp://localhost:5672/%2f");
    config.broker_name_prefix = "billing".to_string();

    assert_err!(config.validate());
}

/// Test: Inconsistent retry and debounce settings are rejected
#[test]
fn test_inconsistent_settings_rejected() {
    let mut config = Config::with_uri("amqp://localhost:5672/%2f");
    config.retry_initial_delay_ms = 120_000;
    assert_err!(config.validate());

    let mut config = Config::with_uri("amqp://localhost:5672/%2f");
    config.debounce_default_wait_for_ms = 120_000;
    assert_err!(config.validate());

    let mut config = Config::with_uri("amqp://localhost:5672/%2f");
    config.broker_publisher_channels = 0;
    assert_err!(config.validate());
}

//! Logging init tests. Kept in a separate test binary because `init`
//! installs a process-global subscriber.

use tomo_daq::logging::{init, LogFormat, LoggingConfig};

#[test]
fn test_init_twice_is_ok() {
    let config = LoggingConfig::default().with_format(LogFormat::Compact);
    assert!(init(config.clone()).is_ok());
    assert!(init(config).is_ok());
}

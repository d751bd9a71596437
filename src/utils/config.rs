//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(CartwrightError)` on parser failure
/// or on any key that is not among the listed fields.
///
/// Example:
/// ```no_run
/// # use cartwright::{parsed_config, CartwrightError, EngineConfig};
/// # fn main() -> Result<(), CartwrightError> {
/// # let config_str: Option<&str> = None;
/// let config = parsed_config!(config_str => EngineConfig; timeout_sec)?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config =
            || -> Result<$config_type, $crate::CartwrightError> {
                let mut config: $config_type = Default::default();
                let config_str = match config_str {
                    Some(s) => s,
                    None => return Ok(config),
                };

                let mut table = config_str.parse::<toml::Table>()?;

                // traverse through all given field names
                $({
                    // if field name found in table (and removed)
                    if let Some(v) = table.remove(stringify!($field)) {
                        config.$field = v.try_into()?;
                    }
                })+

                // if table is not empty at this time, some parsed keys are
                // not expected hence invalid
                if let Some(key) = table.keys().next() {
                    return Err($crate::CartwrightError::new(
                        $crate::ErrorKind::InvalidArgument,
                        format!("invalid field name '{}' in config", key),
                    ));
                }

                Ok(config)
            };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::{CartwrightError, ErrorKind};

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        timeout_sec: u64,
        group: String,
        ratio: u32,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                timeout_sec: 60,
                group: "primary".into(),
                ratio: 4,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), CartwrightError> {
        let config =
            parsed_config!(None => TestConfig; timeout_sec, group, ratio)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), CartwrightError> {
        let config_str = Some("group = 'storage'\nratio = 8");
        let config = parsed_config!(config_str => TestConfig; group, ratio)?;
        let ref_config = TestConfig {
            timeout_sec: 60,
            group: "storage".into(),
            ratio: 8,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        let e = parsed_config!(config_str => TestConfig; timeout_sec);
        assert_eq!(e.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("ratio = 'lots'");
        assert!(parsed_config!(config_str => TestConfig; ratio).is_err());
    }
}

//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`.
/// Returns `Ok(config)` on success, and `Err(ClusterError)` on parser
/// failure.
///
/// Example:
/// ```no_run
/// use volary::parsed_config;
///
/// #[derive(Default)]
/// struct Options {
///     slot_count: u32,
///     node_id: String,
/// }
///
/// fn example(config_str: Option<&str>) -> Result<(), volary::utils::ClusterError> {
///     let opts = parsed_config!(config_str => Options; slot_count, node_id)?;
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config =
            || -> Result<$config_type, $crate::utils::ClusterError> {
                let mut config: $config_type = Default::default();
                if config_str.is_none() {
                    return Ok(config);
                }

                let mut table =
                    config_str.unwrap().parse::<toml::Table>()?;

                // traverse through all given field names
                $({
                    // if field name found in table (and removed)
                    if let Some(v) = table.remove(stringify!($field)) {
                        config.$field = v.try_into().map_err(
                            $crate::utils::ClusterError::msg,
                        )?;
                    }
                })+

                // if table is not empty at this time, some parsed keys are
                // not expected hence invalid
                if !table.is_empty() {
                    return Err($crate::utils::ClusterError::Other(format!(
                        "invalid field name '{}' in config",
                        table.keys().next().unwrap(),
                    )));
                }

                Ok(config)
            };

        compose_config()
    }};
}

use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

/// Read a configuration value from the environment, falling back to
/// `default` when the variable is absent or unparseable.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let raw = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Non-unicode value for {name}, using default {default:?}");
            return default;
        },
    };
    match T::from_str(&raw) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Unparseable value {raw} for {name}, using default {default:?}: {e:?}");
            default
        },
    }
}

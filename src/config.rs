use std::path::PathBuf;

pub const DEFAULT_LOG_SHIFT: i32 = 3;
pub const DEFAULT_ACTOR: &str = "admin";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding every persisted document.
    pub data_dir: PathBuf,
    /// Rotation applied to audit messages before they are written.
    pub log_shift: i32,
    /// Actor recorded on audit entries produced by the record store.
    pub actor: String,
    /// Also persist student identifiers in clear next to the ciphered copy.
    pub keep_plain_identifier: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log_shift: DEFAULT_LOG_SHIFT,
            actor: DEFAULT_ACTOR.to_string(),
            keep_plain_identifier: true,
        }
    }
}

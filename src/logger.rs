use env_logger::{Builder, Env};
use std::io::Write;

/// Installs the process logger. `RUST_LOG`, when set, wins over `level`.
pub fn start_log(level: &str) {
    Builder::from_env(Env::default().default_filter_or(level))
        .format(|buf, record| writeln!(buf, "{}: {}: {}", buf.timestamp(), record.level(), record.args()))
        .init();
}

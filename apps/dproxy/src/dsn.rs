use std::fs::OpenOptions;
use std::path::Path;

/// SQLite DSN for a database file, pre-creating it so the first connection
/// does not fail on a missing file.
pub(crate) fn sqlite_dsn(path: &str) -> std::io::Result<String> {
    let file = Path::new(path);
    if let Some(parent) = file.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    if !file.exists() {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(file)?;
    }

    if let Some(absolute) = path.strip_prefix('/') {
        Ok(format!("sqlite:///{absolute}"))
    } else {
        Ok(format!("sqlite://{path}"))
    }
}

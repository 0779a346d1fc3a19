//! Parameter file
//!
//! Job arguments are handed to the workflow as an INI-style `key=value`
//! file. The workflow may run under another user inside a container, so the
//! file is opened up to everyone.

use flotilla_core::domain::job::Job;
use std::io::Write;
use tempfile::NamedTempFile;

/// Writes the job's parameters to a temporary file
///
/// The file is removed when the returned handle is dropped.
pub fn write_parameter_file(job: &Job) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("flotilla-params-")
        .suffix(".ini")
        .tempfile()?;

    file.write_all(job.parameter_file_contents().as_bytes())?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o777))?;
    }

    Ok(file)
}

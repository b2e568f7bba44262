use std::fs::File;

/// Takes ownership of the process's standard input and output.
///
/// The bridge drops each stream when its direction finishes so the other side
/// of the local pipeline observes end-of-stream; `std::io::stdin()` and
/// `stdout()` never close the underlying descriptors.
#[cfg(unix)]
pub fn local_streams() -> (File, File) {
    use std::os::fd::FromRawFd;

    // SAFETY: the descriptors are open for the life of the process and this
    // is the only place that takes ownership of them.
    unsafe {
        (
            File::from_raw_fd(libc::STDIN_FILENO),
            File::from_raw_fd(libc::STDOUT_FILENO),
        )
    }
}

/// Takes ownership of the process's standard input and output.
#[cfg(windows)]
pub fn local_streams() -> (File, File) {
    use std::os::windows::io::{AsRawHandle, FromRawHandle};

    let stdin = std::io::stdin().as_raw_handle();
    let stdout = std::io::stdout().as_raw_handle();
    // SAFETY: the standard handles are open for the life of the process and
    // this is the only place that takes ownership of them.
    unsafe { (File::from_raw_handle(stdin), File::from_raw_handle(stdout)) }
}

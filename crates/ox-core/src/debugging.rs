//! Host debugger detection

/// Whether a native debugger (not the emulator's own) is attached to
/// this process.
#[cfg(target_os = "linux")]
pub fn is_debugger_attached() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("TracerPid:"))
                .and_then(|line| line["TracerPid:".len()..].trim().parse::<u32>().ok())
        })
        .map(|pid| pid != 0)
        .unwrap_or(false)
}

/// Whether a native debugger (not the emulator's own) is attached to
/// this process.
#[cfg(not(target_os = "linux"))]
pub fn is_debugger_attached() -> bool {
    false
}

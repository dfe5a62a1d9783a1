/// Return the system hostname, or `"unknown"` if it cannot be determined.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".into())
}

/// Name of the effective user.
pub fn username() -> String {
    use nix::unistd::{Uid, User};
    User::from_uid(Uid::effective())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
        .unwrap_or_else(|| "unknown".into())
}

/// `user@host` identity used for maintenance ownership.
pub fn user_at_host() -> String {
    format!("{}@{}", username(), hostname())
}

pub const FULL: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+git.",
    env!("TASKPOINTS_GIT_SHA"),
    env!("TASKPOINTS_GIT_DIRTY")
);

#[cfg(test)]
mod tests {
    use super::FULL;

    #[test]
    fn version_starts_with_package_version() {
        assert!(FULL.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(FULL.contains("+git."));
    }
}

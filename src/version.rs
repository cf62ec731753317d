//! Build metadata stamped by `build/build.rs`.

pub const LABEL: &str = env!("CMDPROXY_VERSION_LABEL");
pub const GIT_SHA: &str = env!("CMDPROXY_GIT_SHA");
pub const BUILD_TIME: &str = env!("CMDPROXY_BUILD_TIME");

const VERSION_WITH_GIT: &str = concat!(
    env!("CMDPROXY_VERSION_LABEL"),
    " (git ",
    env!("CMDPROXY_GIT_SHA"),
    ", built ",
    env!("CMDPROXY_BUILD_TIME"),
    ")",
);
const VERSION_NO_GIT: &str = concat!(
    env!("CMDPROXY_VERSION_LABEL"),
    " (built ",
    env!("CMDPROXY_BUILD_TIME"),
    ")",
);

/// Long version string shown by `--version`.
pub const VERSION: &str = if GIT_SHA.is_empty() {
    VERSION_NO_GIT
} else {
    VERSION_WITH_GIT
};

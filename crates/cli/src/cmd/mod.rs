mod build;
mod from_lerna;

pub use build::cmd_build;
pub use from_lerna::cmd_from_lerna;

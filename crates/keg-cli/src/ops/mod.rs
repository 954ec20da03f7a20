//! Package operations shared by the commands.

pub mod context;
pub mod error;
pub mod install;
pub mod test;
pub mod uninstall;

pub use context::{Context, Overrides};
pub use error::{InstallError, exit};
pub use install::{InstallRequest, InstallSummary, install_packages};
pub use test::test_package;
pub use uninstall::uninstall_package;

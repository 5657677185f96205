pub mod directory;
pub mod paths;
pub mod settings;

pub use directory::{DeviceDirectory, FileDirectory, InMemoryDirectory};
pub use settings::{
    AppConfig, BatchSettings, Credentials, ProbeSettings, ResetSettings, SshSettings,
};

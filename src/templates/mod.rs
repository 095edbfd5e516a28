pub mod context;
pub mod loader;
pub mod resolver;
pub mod sandbox;

pub use context::{Expose, Fields, SafeContext};
pub use loader::{FileSystemLoader, TemplateLoader};
pub use resolver::{OverrideMap, TemplateSource, ThemeResolver};
pub use sandbox::SandboxedEnvironment;

pub mod layout;
pub mod namespace;

pub use layout::LayoutComponent;
pub use namespace::NamespaceComponent;

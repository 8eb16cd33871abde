//! On-disk storage primitives: the Record File foundation, Element Stores
//! for interned array/set/dict contents, Table Catalogs for composites, and
//! Variant Catalogs for payload-bearing enums (spec §4).

pub mod catalog;
pub mod element_store;
pub mod record_file;
pub mod variant_catalog;

pub use catalog::{Catalog, RecordLayout};
pub use element_store::ElementStore;
pub use record_file::RecordFile;
pub use variant_catalog::VariantCatalog;

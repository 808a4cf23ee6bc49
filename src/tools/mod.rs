pub mod lookup;
pub mod lookup_cache;

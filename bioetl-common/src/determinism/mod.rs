//! Canonical value forms, content hashes and the row order used for byte-identical output.
pub mod canonical;
pub mod hashing;
pub mod ordering;

pub use canonical::{
    canonicalize_cell, canonicalize_dataset, canonicalize_date, canonicalize_row,
    canonicalize_value, CanonicalOptions, DEFAULT_FLOAT_PRECISION,
};
pub use hashing::{
    append_hashes, config_hash, hash_business_key, hash_columns, hash_row, sha256_hex,
    HASH_BUSINESS_KEY_COLUMN, HASH_ROW_COLUMN,
};
pub use ordering::{compare_values, sort_dataset, SortKey};

//! Built-in type OIDs the driver knows by name.
//!
//! Values come from `pg_type.dat`; anything not listed here decodes as text.

/// Well-known type OIDs.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const CHAR: u32 = 18;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const REGPROC: u32 = 24;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const TID: u32 = 27;
    pub const XID: u32 = 28;
    pub const CID: u32 = 29;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    /// Removed from the server in 12, still seen on older catalogs.
    pub const ABSTIME: u32 = 702;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const INTERVAL: u32 = 1186;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
}

/// `(oid, typname)` pairs, sorted by oid.
const NAMES: &[(u32, &str)] = &[
    (oid::BOOL, "bool"),
    (oid::BYTEA, "bytea"),
    (oid::CHAR, "char"),
    (oid::NAME, "name"),
    (oid::INT8, "int8"),
    (oid::INT2, "int2"),
    (oid::INT4, "int4"),
    (oid::REGPROC, "regproc"),
    (oid::TEXT, "text"),
    (oid::OID, "oid"),
    (oid::TID, "tid"),
    (oid::XID, "xid"),
    (oid::CID, "cid"),
    (oid::JSON, "json"),
    (oid::FLOAT4, "float4"),
    (oid::FLOAT8, "float8"),
    (oid::ABSTIME, "abstime"),
    (oid::BPCHAR, "bpchar"),
    (oid::VARCHAR, "varchar"),
    (oid::DATE, "date"),
    (oid::TIME, "time"),
    (oid::TIMESTAMP, "timestamp"),
    (oid::TIMESTAMPTZ, "timestamptz"),
    (oid::INTERVAL, "interval"),
    (oid::NUMERIC, "numeric"),
    (oid::UUID, "uuid"),
    (oid::JSONB, "jsonb"),
];

/// Server-side type name for `type_oid`, if it is one of the built-ins above.
pub fn type_name(type_oid: u32) -> Option<&'static str> {
    NAMES
        .binary_search_by_key(&type_oid, |&(oid, _)| oid)
        .ok()
        .map(|i| NAMES[i].1)
}

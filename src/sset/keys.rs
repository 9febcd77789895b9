//! Backend key shaping
//!
//! Every sorted set maps to one backend key. The `database` sits inside
//! braces so it acts as a cluster hash tag: all sets of one database land on
//! the same shard, which is what makes multi-key transactions per database
//! possible. Path segments are percent-encoded so a `:` inside user data
//! cannot alias the segment delimiter.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left bare by `encodeURIComponent`: ASCII alphanumerics plus
/// `-_.!~*'()`. Everything else is escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Shape the backend key for a sorted set.
///
/// Format: `{SSET:database}/seg0:seg1:...`
pub fn sset_key(database: &str, id_path: &[String]) -> String {
    let mut key = format!("{{SSET:{}}}/", database);
    for (i, segment) in id_path.iter().enumerate() {
        if i > 0 {
            key.push(':');
        }
        key.push_str(&utf8_percent_encode(segment, SEGMENT).to_string());
    }
    key
}

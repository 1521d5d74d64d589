use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::constants::{
    ATTR_ATTR_META_DATA, ATTR_ATTR_VALUE_META_DATA, ATTR_DN, ATTR_OBJECT_GUID, ATTR_PARENT_ID,
};
use crate::index_cfg::IndexTypes;

/// Matching rule used to normalize values before they are indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Case-folded, surrounding and repeated inner spaces removed
    CaseIgnore,
    /// Spaces squeezed, case preserved
    CaseExact,
    /// Distinguished name
    Dn,
}

impl Normalization {
    pub fn normalize(&self, value: &[u8]) -> Vec<u8> {
        match self {
            Normalization::CaseIgnore => {
                let mut out = squeeze_spaces(value);
                out.make_ascii_lowercase();
                out
            }
            Normalization::CaseExact => squeeze_spaces(value),
            Normalization::Dn => match std::str::from_utf8(value) {
                Ok(dn) => normalize_dn(dn).into_bytes(),
                Err(_) => value.to_vec(),
            },
        }
    }
}

fn squeeze_spaces(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for word in value.split(|b| *b == b' ').filter(|word| !word.is_empty()) {
        if !out.is_empty() {
            out.push(b' ');
        }
        out.extend_from_slice(word);
    }
    out
}

/// Normalize a DN: RDNs trimmed around `=` and `,`, then case-folded.
///
/// Backslash-escaped commas stay inside their RDN.
pub fn normalize_dn(dn: &str) -> String {
    split_rdns(dn)
        .into_iter()
        .map(|rdn| match rdn.split_once('=') {
            Some((attr, value)) => format!("{}={}", attr.trim(), value.trim()),
            None => rdn.trim().to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
        .to_lowercase()
}

/// Split a DN into RDNs at unescaped commas
pub fn split_rdns(dn: &str) -> Vec<&str> {
    let mut rdns = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (pos, ch) in dn.char_indices() {
        match ch {
            '\\' if !escaped => {
                escaped = true;
                continue;
            }
            ',' if !escaped => {
                rdns.push(&dn[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
        escaped = false;
    }
    if start < dn.len() || !rdns.is_empty() {
        rdns.push(&dn[start..]);
    }
    rdns.retain(|rdn| !rdn.trim().is_empty());
    rdns
}

/// Attribute type as seen by the index layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub name: String,
    /// Stable id used in metadata keys
    pub attr_id: u16,
    pub normalization: Normalization,
    /// Index types this attribute may carry
    pub index_capability: IndexTypes,
}

/// Attribute type lookups
pub trait SchemaLookup {
    fn descriptor(&self, attr_name: &str) -> Option<&AttributeDescriptor>;

    fn attr_id(&self, attr_name: &str) -> Option<u16> {
        self.descriptor(attr_name).map(|desc| desc.attr_id)
    }

    /// Normalize with the attribute's matching rule, case-ignore when unknown
    fn normalize(&self, attr_name: &str, value: &[u8]) -> Vec<u8> {
        self.descriptor(attr_name)
            .map_or(Normalization::CaseIgnore, |desc| desc.normalization)
            .normalize(value)
    }
}

static BUILTIN_ATTRIBUTES: Lazy<Vec<(&'static str, Normalization, IndexTypes)>> = Lazy::new(|| {
    let both = IndexTypes::EQUALITY | IndexTypes::SUBSTR;
    vec![
        (ATTR_DN, Normalization::Dn, IndexTypes::EQUALITY),
        (ATTR_OBJECT_GUID, Normalization::CaseIgnore, IndexTypes::EQUALITY),
        (ATTR_PARENT_ID, Normalization::CaseExact, IndexTypes::EQUALITY),
        (ATTR_ATTR_META_DATA, Normalization::CaseExact, IndexTypes::EQUALITY),
        (ATTR_ATTR_VALUE_META_DATA, Normalization::CaseExact, IndexTypes::EQUALITY),
        ("objectClass", Normalization::CaseIgnore, IndexTypes::EQUALITY),
        ("cn", Normalization::CaseIgnore, both),
        ("sn", Normalization::CaseIgnore, both),
        ("uid", Normalization::CaseIgnore, both),
        ("mail", Normalization::CaseIgnore, both),
        ("userPrincipalName", Normalization::CaseIgnore, both),
        ("sAMAccountName", Normalization::CaseIgnore, both),
        ("member", Normalization::Dn, IndexTypes::EQUALITY),
        ("description", Normalization::CaseIgnore, IndexTypes::empty()),
        ("userPassword", Normalization::CaseExact, IndexTypes::empty()),
    ]
});

/// Map-backed schema
#[derive(Debug, Clone)]
pub struct Schema {
    attributes: HashMap<String, AttributeDescriptor>,
    next_id: u16,
}

impl Schema {
    pub fn new() -> Self {
        Schema {
            attributes: HashMap::new(),
            next_id: 1,
        }
    }

    /// Schema holding the built-in attribute types
    pub fn with_builtins() -> Self {
        let mut schema = Schema::new();
        for (name, normalization, capability) in BUILTIN_ATTRIBUTES.iter() {
            schema.register(name, *normalization, *capability);
        }
        schema
    }

    /// Add an attribute type, returning its id; re-registering keeps the id
    pub fn register(&mut self, name: &str, normalization: Normalization, index_capability: IndexTypes) -> u16 {
        let key = name.to_ascii_lowercase();
        if let Some(existing) = self.attributes.get_mut(&key) {
            existing.normalization = normalization;
            existing.index_capability = index_capability;
            return existing.attr_id;
        }

        let attr_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.attributes.insert(
            key,
            AttributeDescriptor {
                name: name.to_string(),
                attr_id,
                normalization,
                index_capability,
            },
        );
        attr_id
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Schema::new()
    }
}

impl SchemaLookup for Schema {
    fn descriptor(&self, attr_name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.get(&attr_name.to_ascii_lowercase())
    }
}

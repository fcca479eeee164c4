//! Distinguished names: template parsing, numbering of repeated attributes,
//! DER encoding, and reading names back from x509-parser.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;
use x509_parser::x509::X509Name;
use yasna::models::ObjectIdentifier;

use crate::error::{Error, Result};

/// Attribute types accepted in DN templates and request subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    /// `C` / `countryName`.
    Country,
    /// `ST` / `stateOrProvinceName`.
    StateOrProvince,
    /// `L` / `localityName`.
    Locality,
    /// `O` / `organizationName`.
    Organization,
    /// `OU` / `organizationalUnitName`.
    OrganizationalUnit,
    /// `CN` / `commonName`.
    CommonName,
    /// `DC` / `domainComponent`.
    DomainComponent,
    /// `emailAddress`.
    EmailAddress,
    /// `street` / `streetAddress`.
    Street,
    /// `title`.
    Title,
    /// `postalCode`.
    PostalCode,
    /// `serialNumber`.
    SerialNumber,
}

impl AttributeKind {
    const ALL: [Self; 12] = [
        Self::Country,
        Self::StateOrProvince,
        Self::Locality,
        Self::Organization,
        Self::OrganizationalUnit,
        Self::CommonName,
        Self::DomainComponent,
        Self::EmailAddress,
        Self::Street,
        Self::Title,
        Self::PostalCode,
        Self::SerialNumber,
    ];

    /// Resolves a short (OpenSSL-style) or long attribute name.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| {
            kind.short_name().eq_ignore_ascii_case(key) || kind.long_name().eq_ignore_ascii_case(key)
        })
    }

    /// Short attribute name as written in OpenSSL configuration.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::Country => "C",
            Self::StateOrProvince => "ST",
            Self::Locality => "L",
            Self::Organization => "O",
            Self::OrganizationalUnit => "OU",
            Self::CommonName => "CN",
            Self::DomainComponent => "DC",
            Self::EmailAddress => "emailAddress",
            Self::Street => "street",
            Self::Title => "title",
            Self::PostalCode => "postalCode",
            Self::SerialNumber => "serialNumber",
        }
    }

    /// Long attribute name.
    #[must_use]
    pub const fn long_name(self) -> &'static str {
        match self {
            Self::Country => "countryName",
            Self::StateOrProvince => "stateOrProvinceName",
            Self::Locality => "localityName",
            Self::Organization => "organizationName",
            Self::OrganizationalUnit => "organizationalUnitName",
            Self::CommonName => "commonName",
            Self::DomainComponent => "domainComponent",
            Self::EmailAddress => "emailAddress",
            Self::Street => "streetAddress",
            Self::Title => "title",
            Self::PostalCode => "postalCode",
            Self::SerialNumber => "serialNumber",
        }
    }

    /// Attribute OID arcs.
    #[must_use]
    pub const fn oid(self) -> &'static [u64] {
        match self {
            Self::Country => &[2, 5, 4, 6],
            Self::StateOrProvince => &[2, 5, 4, 8],
            Self::Locality => &[2, 5, 4, 7],
            Self::Organization => &[2, 5, 4, 10],
            Self::OrganizationalUnit => &[2, 5, 4, 11],
            Self::CommonName => &[2, 5, 4, 3],
            Self::DomainComponent => &[0, 9, 2342, 19_200_300, 100, 1, 25],
            Self::EmailAddress => &[1, 2, 840, 113_549, 1, 9, 1],
            Self::Street => &[2, 5, 4, 9],
            Self::Title => &[2, 5, 4, 12],
            Self::PostalCode => &[2, 5, 4, 17],
            Self::SerialNumber => &[2, 5, 4, 5],
        }
    }

    /// Resolves a dotted OID string.
    #[must_use]
    pub fn from_oid_str(oid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| {
            let dotted: Vec<String> = kind.oid().iter().map(u64::to_string).collect();
            dotted.join(".") == oid
        })
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// One attribute of a distinguished name.
///
/// `ordinal` is 0 for the first occurrence of a type and counts up for every
/// repeat, in order of appearance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnAttribute {
    /// Attribute type.
    pub kind: AttributeKind,
    /// Attribute value.
    pub value: String,
    /// Occurrence number among attributes of the same type.
    pub ordinal: usize,
}

impl DnAttribute {
    /// Key used in OpenSSL `[ dn ]` sections (`OU`, then `1.OU`, `2.OU`, ...).
    #[must_use]
    pub fn config_key(&self) -> String {
        if self.ordinal == 0 {
            self.kind.short_name().to_string()
        } else {
            format!("{}.{}", self.ordinal, self.kind.short_name())
        }
    }
}

/// An ordered list of attributes forming a subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectName {
    attributes: Vec<DnAttribute>,
}

impl SubjectName {
    /// Appends an attribute, numbering it after any earlier ones of the same type.
    pub fn push(&mut self, kind: AttributeKind, value: impl Into<String>) {
        let ordinal = self.attributes.iter().filter(|a| a.kind == kind).count();
        self.attributes.push(DnAttribute {
            kind,
            value: value.into(),
            ordinal,
        });
    }

    /// Attributes in order.
    #[must_use]
    pub fn attributes(&self) -> &[DnAttribute] {
        &self.attributes
    }

    /// First value of the given attribute type.
    #[must_use]
    pub fn first(&self, kind: AttributeKind) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.value.as_str())
    }

    /// Every value of the given attribute type, in order.
    pub fn values(&self, kind: AttributeKind) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(move |a| a.kind == kind)
            .map(|a| a.value.as_str())
    }

    /// DER `Name` with one single-valued RDN per attribute, in order.
    ///
    /// Values are written as `UTF8String`.
    #[must_use]
    pub fn to_der(&self) -> Vec<u8> {
        yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                for attr in &self.attributes {
                    writer.next().write_set(|writer| {
                        writer.next().write_sequence(|writer| {
                            writer
                                .next()
                                .write_oid(&ObjectIdentifier::from_slice(attr.kind.oid()));
                            writer.next().write_utf8_string(&attr.value);
                        });
                    });
                }
            });
        })
    }

    /// Reads a subject from a parsed certificate or CSR name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DistinguishedName`] for unsupported attribute types
    /// or non-string values.
    pub fn from_x509(name: &X509Name<'_>) -> Result<Self> {
        let mut subject = Self::default();
        for rdn in name.iter() {
            for attr in rdn.iter() {
                let oid = attr.attr_type().to_id_string();
                let kind = AttributeKind::from_oid_str(&oid).ok_or_else(|| {
                    Error::DistinguishedName(format!("unsupported attribute type {oid}"))
                })?;
                let value = attr.as_str().map_err(|e| {
                    Error::DistinguishedName(format!("attribute {kind} is not a string: {e}"))
                })?;
                subject.push(kind, value);
            }
        }
        Ok(subject)
    }
}

impl fmt::Display for SubjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, attr) in self.attributes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", attr.kind, attr.value)?;
        }
        Ok(())
    }
}

/// Caller-supplied base DN to which each node's common name is appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnTemplate {
    base: SubjectName,
}

impl DnTemplate {
    /// Parses a comma-separated `Key=Value` list.
    ///
    /// Entries with an empty key or value are skipped. A `CN` entry is
    /// dropped because the node's common name is always appended last.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty template and
    /// [`Error::DistinguishedName`] for unknown attributes.
    pub fn parse(template: &str) -> Result<Self> {
        if template.trim().is_empty() {
            return Err(Error::Config("DN template is required".into()));
        }

        let mut base = SubjectName::default();
        for entry in template.split(',') {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                continue;
            }
            let kind = AttributeKind::from_key(key)
                .ok_or_else(|| Error::DistinguishedName(format!("unknown attribute '{key}'")))?;
            if kind == AttributeKind::CommonName {
                warn!(value, "ignoring CN in DN template; node common names are appended");
                continue;
            }
            base.push(kind, value);
        }

        if base.attributes().is_empty() {
            return Err(Error::Config(format!(
                "DN template '{template}' has no usable attributes"
            )));
        }
        Ok(Self { base })
    }

    /// Template attributes without a common name.
    #[must_use]
    pub const fn base(&self) -> &SubjectName {
        &self.base
    }

    /// Subject for an entity with the given common name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DistinguishedName`] if `common_name` is empty.
    pub fn subject_for(&self, common_name: &str) -> Result<SubjectName> {
        if common_name.is_empty() {
            return Err(Error::DistinguishedName("common name cannot be empty".into()));
        }
        let mut subject = self.base.clone();
        subject.push(AttributeKind::CommonName, common_name);
        Ok(subject)
    }
}

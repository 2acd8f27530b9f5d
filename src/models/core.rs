// src/models/core.rs
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::MergeError;
use crate::matching::email::normalize_email;
use crate::matching::phone::normalize_phone;
use crate::matching::url::normalize_domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Contact,
    Company,
}

const CONTACT_FIELDS: [FieldName; 9] = [
    FieldName::FirstName,
    FieldName::LastName,
    FieldName::Category,
    FieldName::JobRole,
    FieldName::Description,
    FieldName::Linkedin,
    FieldName::Score,
    FieldName::Birthday,
    FieldName::KeepInTouchFrequency,
];

const COMPANY_FIELDS: [FieldName; 5] = [
    FieldName::Name,
    FieldName::Category,
    FieldName::Description,
    FieldName::Website,
    FieldName::Linkedin,
];

const CONTACT_RELATIONS: [RelationKind; 5] = [
    RelationKind::Tags,
    RelationKind::Cities,
    RelationKind::Companies,
    RelationKind::Emails,
    RelationKind::Mobiles,
];

const COMPANY_RELATIONS: [RelationKind; 3] = [
    RelationKind::Tags,
    RelationKind::Cities,
    RelationKind::Contacts,
];

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Contact => "contact",
            EntityKind::Company => "company",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Contact => "contacts",
            EntityKind::Company => "companies",
        }
    }

    pub fn id_column(&self) -> &'static str {
        match self {
            EntityKind::Contact => "contact_id",
            EntityKind::Company => "company_id",
        }
    }

    /// Scalar fields a merge plan must carry a selection for.
    pub fn fields(&self) -> &'static [FieldName] {
        match self {
            EntityKind::Contact => &CONTACT_FIELDS,
            EntityKind::Company => &COMPANY_FIELDS,
        }
    }

    /// Relationship sets a merge plan must carry a strategy for.
    pub fn relations(&self) -> &'static [RelationKind] {
        match self {
            EntityKind::Contact => &CONTACT_RELATIONS,
            EntityKind::Company => &COMPANY_RELATIONS,
        }
    }

    pub fn has_field(&self, field: FieldName) -> bool {
        self.fields().contains(&field)
    }

    pub fn has_relation(&self, relation: RelationKind) -> bool {
        self.relations().contains(&relation)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "contact" | "contacts" => Ok(EntityKind::Contact),
            "company" | "companies" => Ok(EntityKind::Company),
            other => Err(MergeError::ValidationError(format!(
                "unknown entity kind '{}'",
                other
            ))),
        }
    }
}

/// The storage type behind a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Text,
    Integer,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    FirstName,
    LastName,
    Name,
    Category,
    JobRole,
    Description,
    Linkedin,
    Website,
    Score,
    Birthday,
    KeepInTouchFrequency,
}

impl FieldName {
    /// Column name in the CRM tables; also the key used in UI selection maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::FirstName => "first_name",
            FieldName::LastName => "last_name",
            FieldName::Name => "name",
            FieldName::Category => "category",
            FieldName::JobRole => "job_role",
            FieldName::Description => "description",
            FieldName::Linkedin => "linkedin",
            FieldName::Website => "website",
            FieldName::Score => "score",
            FieldName::Birthday => "birthday",
            FieldName::KeepInTouchFrequency => "keep_in_touch_frequency",
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            FieldName::Score => ValueType::Integer,
            FieldName::Birthday => ValueType::Date,
            _ => ValueType::Text,
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldName {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s.trim() {
            "first_name" => FieldName::FirstName,
            "last_name" => FieldName::LastName,
            "name" => FieldName::Name,
            "category" => FieldName::Category,
            "job_role" => FieldName::JobRole,
            "description" => FieldName::Description,
            "linkedin" => FieldName::Linkedin,
            "website" => FieldName::Website,
            "score" => FieldName::Score,
            "birthday" => FieldName::Birthday,
            "keep_in_touch_frequency" => FieldName::KeepInTouchFrequency,
            other => {
                return Err(MergeError::ValidationError(format!(
                    "unknown field '{}'",
                    other
                )))
            }
        };
        Ok(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Tags,
    Cities,
    Companies,
    Contacts,
    Emails,
    Mobiles,
    /// Lookup-only: searched for shared domains, never merged.
    Domains,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Tags => "tags",
            RelationKind::Cities => "cities",
            RelationKind::Companies => "companies",
            RelationKind::Contacts => "contacts",
            RelationKind::Emails => "emails",
            RelationKind::Mobiles => "mobiles",
            RelationKind::Domains => "domains",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationKind {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let relation = match s.trim() {
            "tags" => RelationKind::Tags,
            "cities" => RelationKind::Cities,
            "companies" => RelationKind::Companies,
            "contacts" => RelationKind::Contacts,
            "emails" => RelationKind::Emails,
            "mobiles" => RelationKind::Mobiles,
            "domains" => RelationKind::Domains,
            other => {
                return Err(MergeError::ValidationError(format!(
                    "unknown relationship '{}'",
                    other
                )))
            }
        };
        Ok(relation)
    }
}

/// A physical many-to-many association table, seen from its owning entity.
///
/// `contact_companies` backs both `ContactCompanies` and `CompanyContacts`;
/// the two variants read the same rows from opposite sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Relation {
    ContactTags,
    ContactCities,
    ContactCompanies,
    ContactEmails,
    ContactMobiles,
    CompanyTags,
    CompanyCities,
    CompanyContacts,
    CompanyDomains,
}

impl Relation {
    pub fn for_entity(owner: EntityKind, kind: RelationKind) -> Option<Self> {
        match (owner, kind) {
            (EntityKind::Contact, RelationKind::Tags) => Some(Relation::ContactTags),
            (EntityKind::Contact, RelationKind::Cities) => Some(Relation::ContactCities),
            (EntityKind::Contact, RelationKind::Companies) => Some(Relation::ContactCompanies),
            (EntityKind::Contact, RelationKind::Emails) => Some(Relation::ContactEmails),
            (EntityKind::Contact, RelationKind::Mobiles) => Some(Relation::ContactMobiles),
            (EntityKind::Company, RelationKind::Tags) => Some(Relation::CompanyTags),
            (EntityKind::Company, RelationKind::Cities) => Some(Relation::CompanyCities),
            (EntityKind::Company, RelationKind::Contacts) => Some(Relation::CompanyContacts),
            (EntityKind::Company, RelationKind::Domains) => Some(Relation::CompanyDomains),
            _ => None,
        }
    }

    /// All associations owned by an entity kind, in plan order.
    pub fn all_for(owner: EntityKind) -> Vec<Relation> {
        owner
            .relations()
            .iter()
            .filter_map(|kind| Relation::for_entity(owner, *kind))
            .collect()
    }

    pub fn owner_kind(&self) -> EntityKind {
        match self {
            Relation::ContactTags
            | Relation::ContactCities
            | Relation::ContactCompanies
            | Relation::ContactEmails
            | Relation::ContactMobiles => EntityKind::Contact,
            Relation::CompanyTags
            | Relation::CompanyCities
            | Relation::CompanyContacts
            | Relation::CompanyDomains => EntityKind::Company,
        }
    }

    pub fn relation_kind(&self) -> RelationKind {
        match self {
            Relation::ContactTags | Relation::CompanyTags => RelationKind::Tags,
            Relation::ContactCities | Relation::CompanyCities => RelationKind::Cities,
            Relation::ContactCompanies => RelationKind::Companies,
            Relation::CompanyContacts => RelationKind::Contacts,
            Relation::ContactEmails => RelationKind::Emails,
            Relation::ContactMobiles => RelationKind::Mobiles,
            Relation::CompanyDomains => RelationKind::Domains,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Relation::ContactTags => "contact_tags",
            Relation::ContactCities => "contact_cities",
            Relation::ContactCompanies | Relation::CompanyContacts => "contact_companies",
            Relation::ContactEmails => "contact_emails",
            Relation::ContactMobiles => "contact_mobiles",
            Relation::CompanyTags => "companies_tags",
            Relation::CompanyCities => "companies_cities",
            Relation::CompanyDomains => "company_domains",
        }
    }

    pub fn owner_column(&self) -> &'static str {
        self.owner_kind().id_column()
    }

    pub fn related_column(&self) -> &'static str {
        match self {
            Relation::ContactTags | Relation::CompanyTags => "tag_id",
            Relation::ContactCities | Relation::CompanyCities => "city_id",
            Relation::ContactCompanies => "company_id",
            Relation::CompanyContacts => "contact_id",
            Relation::ContactEmails => "email",
            Relation::ContactMobiles => "mobile",
            Relation::CompanyDomains => "domain",
        }
    }

    /// Membership key for a related id. Foreign ids compare verbatim; stored
    /// values (emails, mobiles, domains) compare after normalization.
    pub fn canonical(&self, related_id: &str) -> String {
        match self {
            Relation::ContactEmails => normalize_email(related_id),
            Relation::ContactMobiles => normalize_phone(related_id),
            Relation::CompanyDomains => normalize_domain(related_id),
            _ => related_id.trim().to_string(),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner_kind(), self.relation_kind())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Date(NaiveDate),
}

static NULL_VALUE: FieldValue = FieldValue::Null;

impl FieldValue {
    /// Null and blank text are both "no value".
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Integer(_) | FieldValue::Date(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) if !s.trim().is_empty() => Some(s.trim()),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// A contact or company record with its scalar fields.
///
/// Relationship sets are not carried on the entity; they live in the
/// association tables and are read through `EntityStore::list_associations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub fields: BTreeMap<FieldName, FieldValue>,
}

impl Entity {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: FieldName, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field, value.into());
        self
    }

    pub fn field(&self, field: FieldName) -> &FieldValue {
        self.fields.get(&field).unwrap_or(&NULL_VALUE)
    }

    /// Trimmed, non-empty text value of a field.
    pub fn text(&self, field: FieldName) -> Option<&str> {
        self.field(field).as_text()
    }

    pub fn category(&self) -> Option<&str> {
        self.text(FieldName::Category)
    }

    /// True once the record has been absorbed by a merge.
    pub fn is_merged(&self, merged_category: &str) -> bool {
        self.category()
            .map(|c| c.eq_ignore_ascii_case(merged_category))
            .unwrap_or(false)
    }

    /// "First Last" for contacts, the name for companies.
    pub fn display_name(&self) -> String {
        match self.kind {
            EntityKind::Contact => [self.text(FieldName::FirstName), self.text(FieldName::LastName)]
                .iter()
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
            EntityKind::Company => self.text(FieldName::Name).unwrap_or_default().to_string(),
        }
    }
}

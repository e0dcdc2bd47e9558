//! Scope Catalog: the fixed vocabulary of scopes an application may request.
//!
//! Every scope maps to exactly one attribute type. Labels are the Spanish
//! strings shown in the consent and collection prompts.

use serde::{Deserialize, Serialize};

use crate::error::{CustodiaError, CustodiaResult};
use crate::types::{AttributeType, ScopeName, ScopeSet};

/// How a collection form should render the input. Not used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputHint {
    Text,
    Email,
    Tel,
    Date,
    Number,
    Select,
}

/// Grouping used by the profile view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Personal,
    Contact,
    Professional,
    Financial,
}

impl Category {
    pub fn title(&self) -> &'static str {
        match self {
            Category::Personal => "Información Personal",
            Category::Contact => "Datos de Contacto",
            Category::Professional => "Información Profesional",
            Category::Financial => "Datos Financieros",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDefinition {
    pub scope_name: ScopeName,
    pub attribute_type: AttributeType,
    pub display_label: String,
    pub input_hint: InputHint,
    pub category: Category,
}

impl ScopeDefinition {
    fn standard(attribute_type: AttributeType) -> Self {
        let (label, hint, category) = match attribute_type {
            AttributeType::LegalId => ("RUT / DNI", InputHint::Text, Category::Personal),
            AttributeType::Email => ("Correo electrónico", InputHint::Email, Category::Contact),
            AttributeType::Phone => ("Teléfono", InputHint::Tel, Category::Contact),
            AttributeType::LegalNameFirst => ("Nombres", InputHint::Text, Category::Personal),
            AttributeType::LegalNameLast => ("Apellidos", InputHint::Text, Category::Personal),
            AttributeType::BirthDate => {
                ("Fecha de nacimiento", InputHint::Date, Category::Personal)
            }
            AttributeType::Nationality => ("Nacionalidad", InputHint::Text, Category::Personal),
            AttributeType::MaritalStatus => {
                ("Estado civil", InputHint::Select, Category::Personal)
            }
            AttributeType::Address => ("Dirección", InputHint::Text, Category::Contact),
            AttributeType::Gender => ("Género", InputHint::Select, Category::Personal),
            AttributeType::Profession => ("Profesión", InputHint::Text, Category::Professional),
            AttributeType::Income => ("Ingresos", InputHint::Number, Category::Financial),
            AttributeType::JobTitle => ("Cargo", InputHint::Text, Category::Professional),
        };
        Self {
            scope_name: ScopeName::new(attribute_type.as_str()),
            attribute_type,
            display_label: label.to_string(),
            input_hint: hint,
            category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCatalog {
    definitions: Vec<ScopeDefinition>,
}

impl ScopeCatalog {
    /// Every attribute type, in declaration order.
    pub fn standard() -> Self {
        Self {
            definitions: AttributeType::ALL
                .into_iter()
                .map(ScopeDefinition::standard)
                .collect(),
        }
    }

    /// The standard catalog minus the given scopes. Names that are not in the
    /// standard catalog are a configuration error.
    pub fn standard_without(disabled: &[ScopeName]) -> CustodiaResult<Self> {
        let standard = Self::standard();
        if let Some(unknown) = disabled.iter().find(|s| standard.lookup(s).is_none()) {
            return Err(CustodiaError::Configuration(format!(
                "cannot disable unknown scope '{}'",
                unknown
            )));
        }
        Ok(Self {
            definitions: standard
                .definitions
                .into_iter()
                .filter(|d| !disabled.contains(&d.scope_name))
                .collect(),
        })
    }

    pub fn definitions(&self) -> &[ScopeDefinition] {
        &self.definitions
    }

    pub fn lookup(&self, scope: &ScopeName) -> Option<&ScopeDefinition> {
        self.definitions.iter().find(|d| &d.scope_name == scope)
    }

    pub fn definition_for(&self, attribute_type: AttributeType) -> Option<&ScopeDefinition> {
        self.definitions
            .iter()
            .find(|d| d.attribute_type == attribute_type)
    }

    pub fn attribute_type(&self, scope: &ScopeName) -> Option<AttributeType> {
        self.lookup(scope).map(|d| d.attribute_type)
    }

    /// Scopes of `requested` the catalog does not know, in request order.
    pub fn unknown_in(&self, requested: &ScopeSet) -> ScopeSet {
        ScopeSet::new(
            requested
                .iter()
                .filter(|s| self.lookup(s).is_none())
                .cloned(),
        )
    }
}

impl Default for ScopeCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

use serde::{Deserialize, Serialize};

/// Structured listing constraints. Unset fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListingFilter {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_rooms: Option<u32>,
    #[serde(default)]
    pub furnished: Option<bool>,
    #[serde(default)]
    pub pet_friendly: Option<bool>,
}

impl ListingFilter {
    pub fn is_empty(&self) -> bool {
        self.to_odata().is_none()
    }

    /// Render as an OData `$filter` expression, or `None` when nothing is
    /// constrained.
    pub fn to_odata(&self) -> Option<String> {
        let mut clauses = Vec::new();

        if let Some(location) = self.location.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            clauses.push(format!("search.in(location, '{}', ',')", escape(location)));
        }
        if let Some(max_price) = self.max_price {
            clauses.push(format!("price le {max_price}"));
        }
        if let Some(min_rooms) = self.min_rooms {
            clauses.push(format!("rooms ge {min_rooms}"));
        }
        if let Some(furnished) = self.furnished {
            clauses.push(format!("furnished eq {furnished}"));
        }
        if let Some(pets) = self.pet_friendly {
            clauses.push(format!("pets_allowed eq {pets}"));
        }

        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" and "))
        }
    }
}

/// OData string literals double their single quotes.
fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

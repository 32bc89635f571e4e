use serde::{Deserialize, Serialize};

/// One flat listing as stored in the index. Missing fields fall back to
/// empty values so a sparse document still renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default = "unknown_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub rooms: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub floor: i64,
    #[serde(default)]
    pub availability: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
}

fn unknown_id() -> String {
    "unknown_id".to_string()
}

/// Index fields to return; keeps the embedding vector off the wire.
pub(crate) const SELECT_FIELDS: &str =
    "id,title,description,location,price,contact,rooms,size,floor,availability,lat,lng";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_document_gets_defaults() {
        let listing: Listing = serde_json::from_value(serde_json::json!({
            "title": "Altbau near Naschmarkt",
            "price": 1250.0,
            "@search.score": 0.83
        }))
        .unwrap();
        assert_eq!(listing.id, "unknown_id");
        assert_eq!(listing.title, "Altbau near Naschmarkt");
        assert_eq!(listing.rooms, 0);
        assert_eq!(listing.lat, 0.0);
    }

    #[test]
    fn select_matches_struct_fields() {
        let listing: Listing = serde_json::from_str("{}").unwrap();
        let value = serde_json::to_value(&listing).unwrap();
        let mut fields: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        let mut selected: Vec<_> = SELECT_FIELDS.split(',').map(str::to_string).collect();
        fields.sort();
        selected.sort();
        assert_eq!(fields, selected);
    }
}

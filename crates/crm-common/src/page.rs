use serde::{Deserialize, Deserializer, Serialize};

/// One page of a list endpoint.
///
/// Endpoints answer either `{ "items": [...], "total": n }` or a bare JSON
/// array; the bare form decodes with `total` equal to its length.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64) -> Self {
        Self { items, total }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PageWire<T> {
    Paged { items: Vec<T>, total: u64 },
    Bare(Vec<T>),
}

impl<'de, T> Deserialize<'de> for Page<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match PageWire::deserialize(deserializer)? {
            PageWire::Paged { items, total } => Page { items, total },
            PageWire::Bare(items) => {
                let total = items.len() as u64;
                Page { items, total }
            }
        })
    }
}

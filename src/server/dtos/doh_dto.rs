use serde::Deserialize;

/// A record type in DNS json answers
pub const RECORD_TYPE_A: u16 = 1;

/// json DoH answer, as served by cloudflare/google with `Accept: application/dns-json`
///
/// only the fields we read are here, everything else in the payload is ignored
#[derive(Debug, Clone, Deserialize)]
pub struct DohResponse {
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "Answer", default)]
    pub answer: Vec<DohAnswer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DohAnswer {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u64,
    pub data: String,
}

impl DohResponse {
    /// first A record, CNAME entries before it are skipped
    pub fn first_a_record(&self) -> Option<&DohAnswer> {
        self.answer.iter().find(|a| a.record_type == RECORD_TYPE_A)
    }
}

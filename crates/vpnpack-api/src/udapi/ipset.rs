// Firewall address sets under `/firewall/sets`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::client::{Method, UdapiClient};
use crate::Error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetIdentification {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

/// One address set as the server returns it. Fields the daemon does not
/// touch are carried through unchanged on update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirewallSet {
    #[serde(default)]
    pub identification: SetIdentification,
    #[serde(default)]
    pub entries: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UdapiClient {
    pub async fn list_sets(&self) -> Result<Vec<FirewallSet>, Error> {
        self.get("/firewall/sets").await?.decode()
    }

    async fn find_set(&self, name: &str) -> Result<Option<FirewallSet>, Error> {
        Ok(self
            .list_sets()
            .await?
            .into_iter()
            .find(|s| s.identification.name == name))
    }

    async fn put_set(&self, set: &FirewallSet) -> Result<(), Error> {
        let body = serde_json::to_value(set).map_err(|e| Error::BadResponse {
            message: format!("encode set: {e}"),
        })?;
        self.request(Method::Put, "/firewall/sets/set", Some(&body))
            .await?;
        Ok(())
    }

    /// Add `cidr` to the named set. A missing set is an error because the
    /// daemon never creates sets itself.
    pub async fn ensure_set_entry(&self, set_name: &str, cidr: &str) -> Result<(), Error> {
        let Some(mut set) = self.find_set(set_name).await? else {
            return Err(Error::BadResponse {
                message: format!("{set_name} ipset not found"),
            });
        };
        if set.entries.iter().any(|e| e == cidr) {
            return Ok(());
        }
        set.entries.push(cidr.to_owned());
        self.put_set(&set).await?;
        debug!(set = set_name, cidr, "ipset entry added");
        Ok(())
    }

    /// Remove `cidr` from the named set. Absent set or entry is a no-op.
    pub async fn remove_set_entry(&self, set_name: &str, cidr: &str) -> Result<(), Error> {
        let Some(mut set) = self.find_set(set_name).await? else {
            return Ok(());
        };
        let before = set.entries.len();
        set.entries.retain(|e| e != cidr);
        if set.entries.len() == before {
            return Ok(());
        }
        self.put_set(&set).await?;
        debug!(set = set_name, cidr, "ipset entry removed");
        Ok(())
    }
}

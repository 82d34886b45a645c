// In-memory stand-ins for the kernel and host seams, an in-process udapi
// server, and wiremock fixtures for the Integration API.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnet::IpNet;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vpnpack_core::system::{
    DeviceSpec, DeviceStats, HostProbe, InterfaceSubnet, Netlink, PeerSpec, SystemSubnets,
    WireGuard,
};
use vpnpack_core::{Backends, CoreError, DaemonConfig, Paths};

// ── Netlink ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NetState {
    pub links: BTreeMap<String, u32>,
    pub up: BTreeSet<u32>,
    pub mtu: HashMap<u32, u32>,
    pub addresses: HashMap<u32, BTreeSet<IpNet>>,
    pub routes: HashMap<u32, BTreeSet<IpNet>>,
    pub created: usize,
    pub next_index: u32,
    /// `add_route` to this destination fails.
    pub fail_route: Option<IpNet>,
    /// Reported by `system_subnets` as addresses on other interfaces.
    pub local_subnets: Vec<InterfaceSubnet>,
}

#[derive(Debug, Default)]
pub struct FakeNetlink {
    pub state: Mutex<NetState>,
}

impl FakeNetlink {
    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().unwrap().links.contains_key(name)
    }

    /// Routes out of `name`, empty when the link is missing.
    pub fn routes(&self, name: &str) -> Vec<IpNet> {
        let state = self.state.lock().unwrap();
        state
            .links
            .get(name)
            .and_then(|idx| state.routes.get(idx))
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn fail_route(&self, dst: IpNet) {
        self.state.lock().unwrap().fail_route = Some(dst);
    }

    pub fn add_local_subnet(&self, interface: &str, cidr: IpNet) {
        self.state.lock().unwrap().local_subnets.push(InterfaceSubnet {
            interface: interface.to_owned(),
            cidr,
        });
    }
}

#[async_trait]
impl Netlink for FakeNetlink {
    async fn link_index(&self, name: &str) -> Result<Option<u32>, CoreError> {
        Ok(self.state.lock().unwrap().links.get(name).copied())
    }

    async fn create_wireguard(&self, name: &str) -> Result<u32, CoreError> {
        let mut state = self.state.lock().unwrap();
        if state.links.contains_key(name) {
            return Err(CoreError::network("create link", format!("{name} exists")));
        }
        state.next_index += 1;
        let index = state.next_index + 100;
        state.links.insert(name.to_owned(), index);
        state.created += 1;
        Ok(index)
    }

    async fn delete_link(&self, index: u32) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        state.links.retain(|_, idx| *idx != index);
        state.routes.remove(&index);
        state.addresses.remove(&index);
        state.up.remove(&index);
        Ok(())
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), CoreError> {
        self.state.lock().unwrap().mtu.insert(index, mtu);
        Ok(())
    }

    async fn set_up(&self, index: u32) -> Result<(), CoreError> {
        self.state.lock().unwrap().up.insert(index);
        Ok(())
    }

    async fn add_address(&self, index: u32, addr: IpNet) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        state.addresses.entry(index).or_default().insert(addr);
        Ok(())
    }

    async fn delete_address(&self, index: u32, addr: IpNet) -> Result<(), CoreError> {
        if let Some(set) = self.state.lock().unwrap().addresses.get_mut(&index) {
            set.remove(&addr);
        }
        Ok(())
    }

    async fn add_route(&self, index: u32, dst: IpNet) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_route == Some(dst) {
            return Err(CoreError::network("add route", format!("{dst} rejected")));
        }
        state.routes.entry(index).or_default().insert(dst);
        Ok(())
    }

    async fn delete_route(&self, index: u32, dst: IpNet) -> Result<(), CoreError> {
        if let Some(set) = self.state.lock().unwrap().routes.get_mut(&index) {
            set.remove(&dst);
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn system_subnets(&self, exclude: &[&str]) -> Result<SystemSubnets, CoreError> {
        let interfaces = self
            .state
            .lock()
            .unwrap()
            .local_subnets
            .iter()
            .filter(|s| !exclude.contains(&s.interface.as_str()))
            .cloned()
            .collect();
        Ok(SystemSubnets {
            interfaces,
            routes: Vec::new(),
        })
    }
}

// ── WireGuard ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FakeWireGuard {
    pub devices: Mutex<HashMap<String, DeviceSpec>>,
    pub peer_updates: Mutex<Vec<(String, PeerSpec)>>,
    pub fail_configure: Mutex<bool>,
}

impl FakeWireGuard {
    pub fn fail_configure(&self, fail: bool) {
        *self.fail_configure.lock().unwrap() = fail;
    }

    pub fn device(&self, iface: &str) -> Option<DeviceSpec> {
        self.devices.lock().unwrap().get(iface).cloned()
    }

    pub fn peer_updates(&self) -> usize {
        self.peer_updates.lock().unwrap().len()
    }
}

#[async_trait]
impl WireGuard for FakeWireGuard {
    async fn configure(&self, iface: &str, device: &DeviceSpec) -> Result<(), CoreError> {
        if *self.fail_configure.lock().unwrap() {
            return Err(CoreError::network("configure", "device rejected"));
        }
        self.devices
            .lock()
            .unwrap()
            .insert(iface.to_owned(), device.clone());
        Ok(())
    }

    async fn update_peer(&self, iface: &str, peer: &PeerSpec) -> Result<(), CoreError> {
        self.peer_updates
            .lock()
            .unwrap()
            .push((iface.to_owned(), peer.clone()));
        Ok(())
    }

    async fn stats(&self, iface: &str) -> Result<DeviceStats, CoreError> {
        let devices = self.devices.lock().unwrap();
        let device = devices
            .get(iface)
            .ok_or_else(|| CoreError::not_found("device", iface))?;
        Ok(DeviceStats {
            listen_port: Some(device.listen_port),
            ..DeviceStats::default()
        })
    }
}

// ── Host probe ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FakeProbe {
    pub busy_ports: Mutex<HashSet<u16>>,
    pub chains: Mutex<HashMap<String, String>>,
    pub sets: Mutex<HashMap<String, String>>,
    pub zone_ids: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn occupy(&self, port: u16) {
        self.busy_ports.lock().unwrap().insert(port);
    }
}

#[async_trait]
impl HostProbe for FakeProbe {
    async fn chain_rules(&self, chain: &str) -> Option<String> {
        self.chains.lock().unwrap().get(chain).cloned()
    }

    async fn ipset_list(&self, set: &str) -> Option<String> {
        self.sets.lock().unwrap().get(set).cloned()
    }

    async fn custom_zone_ids(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.zone_ids.lock().unwrap().clone())
    }

    async fn udp_port_free(&self, port: u16) -> Result<(), std::io::Error> {
        if self.busy_ports.lock().unwrap().contains(&port) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "address in use",
            ));
        }
        Ok(())
    }
}

// ── Bundle ──────────────────────────────────────────────────────────

pub struct Fakes {
    pub netlink: Arc<FakeNetlink>,
    pub wireguard: Arc<FakeWireGuard>,
    pub probe: Arc<FakeProbe>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            netlink: Arc::new(FakeNetlink::default()),
            wireguard: Arc::new(FakeWireGuard::default()),
            probe: Arc::new(FakeProbe::default()),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            netlink: self.netlink.clone(),
            wireguard: self.wireguard.clone(),
            probe: self.probe.clone(),
        }
    }
}

// ── udapi server ────────────────────────────────────────────────────

/// Firewall chains and address sets held by the in-process udapi server.
#[derive(Debug, Default)]
pub struct UdapiState {
    pub chains: HashMap<String, Vec<Value>>,
    pub sets: Vec<Value>,
    pub next_id: i64,
    pub requests: Vec<(String, String)>,
}

impl UdapiState {
    /// An address set with the given entries, as the server lists it.
    pub fn add_set(&mut self, name: &str, entries: &[&str]) {
        self.sets.push(json!({
            "identification": { "type": "address-group", "name": name },
            "entries": entries,
            "ipVersion": "v4",
        }));
    }

    pub fn set_entries(&self, name: &str) -> Vec<String> {
        self.sets
            .iter()
            .find(|s| s["identification"]["name"] == name)
            .map(|s| serde_json::from_value(s["entries"].clone()).unwrap())
            .unwrap_or_default()
    }

    pub fn rule_descriptions(&self, chain: &str) -> Vec<String> {
        self.chains
            .get(chain)
            .map(|rules| {
                rules
                    .iter()
                    .map(|r| r["description"].as_str().unwrap_or_default().to_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn handle(&mut self, method: &str, entity: &str, request: &Value) -> Value {
        self.requests.push((method.to_owned(), entity.to_owned()));
        let parts: Vec<_> = entity.trim_start_matches('/').split('/').collect();
        match (method, parts.as_slice()) {
            ("GET", ["firewall", "filter", chain]) => {
                json!({ "rules": self.chains.get(*chain).cloned().unwrap_or_default() })
            }
            ("POST", ["firewall", "filter", chain, "rule"]) => {
                self.next_id += 1;
                let mut rule = request.clone();
                rule["id"] = json!(self.next_id);
                self.chains.entry((*chain).to_owned()).or_default().push(rule);
                json!({})
            }
            ("DELETE", ["firewall", "filter", chain, "rule"]) => {
                if let Some(rules) = self.chains.get_mut(*chain) {
                    rules.retain(|r| r["id"] != request["id"]);
                }
                json!({})
            }
            ("GET", ["firewall", "sets"]) => Value::Array(self.sets.clone()),
            ("PUT", ["firewall", "sets", "set"]) => {
                let name = &request["identification"]["name"];
                for set in &mut self.sets {
                    if &set["identification"]["name"] == name {
                        *set = request.clone();
                    }
                }
                json!({})
            }
            _ => json!({ "error": "unknown entity" }),
        }
    }
}

async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Option<Value> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let len: usize = line.trim().parse().ok()?;
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await.ok()?;
    serde_json::from_slice(&buf).ok()
}

/// Serve the udapi framing on `sock` until the runtime shuts down.
pub fn start_udapi(sock: &Path) -> Arc<Mutex<UdapiState>> {
    let state = Arc::new(Mutex::new(UdapiState::default()));
    let listener = UnixListener::bind(sock).unwrap();
    let shared = Arc::clone(&state);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let state = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let Some(env) = read_frame(&mut reader).await else {
                    return;
                };
                let method = env["method"].as_str().unwrap_or_default().to_owned();
                let entity = env["entity"].as_str().unwrap_or_default().to_owned();
                let payload = env.get("request").cloned().unwrap_or(Value::Null);
                let response = state.lock().unwrap().handle(&method, &entity, &payload);
                let reply = json!({
                    "id": env["id"],
                    "version": "v1.0",
                    "method": method,
                    "entity": entity,
                    "response": response,
                })
                .to_string();
                let frame = format!("{}\n{reply}", reply.len());
                let _ = reader.get_mut().write_all(frame.as_bytes()).await;
            });
        }
    });

    state
}

// ── Integration API ─────────────────────────────────────────────────

pub const BASE: &str = "/proxy/network/integration";

pub fn config(root: &Path, server: &MockServer) -> DaemonConfig {
    let mut paths = Paths::under(root);
    paths.udapi_socket = root.join("udapi.sock");
    paths.udapi_net_config = root.join("udapi-net-cfg.json");
    paths.sys_class_net = root.join("sys");
    std::fs::create_dir_all(&paths.sys_class_net).unwrap();

    let mut config = DaemonConfig::with_paths(paths);
    config.integration.base_url = format!("{}{BASE}", server.uri());
    config
}

pub fn key(raw: &str) -> SecretString {
    SecretString::from(raw.to_owned())
}

pub fn page(data: serde_json::Value) -> ResponseTemplate {
    let count = data.as_array().map_or(0, Vec::len);
    ResponseTemplate::new(200).set_body_json(json!({
        "offset": 0, "limit": 200, "count": count, "totalCount": count, "data": data
    }))
}

pub async fn mount_info(server: &MockServer, status: u16) {
    let response = if status == 200 {
        ResponseTemplate::new(200).set_body_json(json!({ "applicationVersion": "9.1.120" }))
    } else {
        ResponseTemplate::new(status).set_body_json(json!({ "message": "unauthorized" }))
    };
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/info")))
        .respond_with(response)
        .mount(server)
        .await;
}

/// A site with the built-in zones plus whatever the daemon creates.
pub async fn mount_site(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/sites")))
        .respond_with(page(json!([{ "id": "site-1", "name": "Default" }])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/sites/site-1/firewall/zones")))
        .respond_with(page(json!([
            { "id": "z-int", "name": "Internal" },
            { "id": "z-ext", "name": "External" },
            { "id": "z-gw", "name": "Gateway" },
        ])))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{BASE}/v1/sites/site-1/firewall/zones")))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({ "id": "z-new", "name": "VPN Pack: created" })),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/sites/site-1/firewall/policies")))
        .respond_with(page(json!([])))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{BASE}/v1/sites/site-1/firewall/policies")))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "p-new" })))
        .mount(server)
        .await;
}

pub fn net(cidr: &str) -> IpNet {
    cidr.parse().unwrap()
}

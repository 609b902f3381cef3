//! In-memory datacenter backend.
//!
//! Used by the test suite and by the console binary when no vendor SDK is
//! linked in. Remote jobs finish after a configurable number of status polls,
//! and every call is recorded so tests can check who was asked to do what.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use console_core::error::{ConsoleError, Result};

use crate::api::{
    CloudApi, CloudConnector, JobLookup, PackageSize, PendingJob, PublicIp, ServerId, Template,
    VmCreator, VmRef, VmVariant,
};
use crate::datacenter::DatacenterId;

/// Knobs for how a simulated datacenter behaves.
#[derive(Debug, Clone)]
pub struct SimBehaviour {
    /// Delay added to every remote call.
    pub latency: Duration,
    /// How long a commit call takes.
    pub commit_duration: Duration,
    /// Status polls a job stays pending for.
    pub job_polls: u32,
    pub reject_commits: bool,
    /// Commits panic instead of answering.
    pub panic_commits: bool,
    pub fail_power: bool,
    /// Accepted credentials. `None` accepts any user with a non-empty password.
    pub credentials: Option<(String, String)>,
}

impl Default for SimBehaviour {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            commit_duration: Duration::ZERO,
            job_polls: 1,
            reject_commits: false,
            panic_commits: false,
            fail_power: false,
            credentials: None,
        }
    }
}

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub datacenter: DatacenterId,
    pub method: &'static str,
    pub target: Option<String>,
}

/// Counters shared by every simulated datacenter of one connector.
#[derive(Debug, Default)]
pub struct SimMetrics {
    active_commits: AtomicUsize,
    peak_commits: AtomicUsize,
    commits: AtomicU64,
    active_creations: AtomicUsize,
    peak_creations: AtomicUsize,
    calls: Mutex<Vec<SimCall>>,
}

impl SimMetrics {
    pub fn peak_concurrent_commits(&self) -> usize {
        self.peak_commits.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Most creations seen between an accepted commit and the first search
    /// that returned the new server.
    pub fn peak_concurrent_creations(&self) -> usize {
        self.peak_creations.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_to(&self, datacenter: &DatacenterId, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|call| &call.datacenter == datacenter && call.method == method)
            .count()
    }

    fn record(&self, datacenter: &DatacenterId, method: &'static str, target: Option<String>) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SimCall {
                datacenter: datacenter.clone(),
                method,
                target,
            });
    }

    fn commit_started(&self) {
        let active = self.active_commits.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_commits.fetch_max(active, Ordering::SeqCst);
    }

    fn commit_finished(&self) {
        self.active_commits.fetch_sub(1, Ordering::SeqCst);
        self.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn creation_started(&self) {
        let active = self.active_creations.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_creations.fetch_max(active, Ordering::SeqCst);
    }

    fn creation_observed(&self) {
        self.active_creations.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum JobEffect {
    Nothing,
    Provision(VmRef),
}

#[derive(Debug)]
struct SimJob {
    id: u64,
    server_name: String,
    operation: &'static str,
    polls_left: u32,
    effect: JobEffect,
}

#[derive(Debug, Default)]
struct SimState {
    servers: BTreeMap<ServerId, VmRef>,
    jobs: Vec<SimJob>,
    public_ips: HashMap<String, String>,
    /// Accepted creations no search has returned yet.
    unobserved: HashSet<String>,
    next_server_id: ServerId,
    next_job_id: u64,
    next_ip: u32,
}

impl SimState {
    fn allocate_ip(&mut self) -> String {
        self.next_ip += 1;
        format!("10.0.{}.{}", self.next_ip / 250, self.next_ip % 250 + 2)
    }

    fn add_job(&mut self, server_name: &str, operation: &'static str, polls: u32, effect: JobEffect) {
        self.next_job_id += 1;
        let job = SimJob {
            id: self.next_job_id,
            server_name: server_name.to_string(),
            operation,
            polls_left: polls,
            effect,
        };
        if polls == 0 {
            self.finish(job);
        } else {
            self.jobs.push(job);
        }
    }

    /// Advances every job by one status poll.
    fn tick(&mut self) {
        let (finished, running): (Vec<SimJob>, Vec<SimJob>) = std::mem::take(&mut self.jobs)
            .into_iter()
            .map(|mut job| {
                job.polls_left = job.polls_left.saturating_sub(1);
                job
            })
            .partition(|job| job.polls_left == 0);
        self.jobs = running;
        for job in finished {
            self.finish(job);
        }
    }

    fn finish(&mut self, job: SimJob) {
        if let JobEffect::Provision(vm) = job.effect {
            self.servers.insert(vm.server_id, vm);
        }
    }

    fn server_mut(&mut self, id: ServerId) -> Result<&mut VmRef> {
        self.servers
            .get_mut(&id)
            .ok_or_else(|| ConsoleError::NotFound(format!("server {}", id)))
    }
}

#[derive(Debug)]
struct Inner {
    id: DatacenterId,
    behaviour: SimBehaviour,
    metrics: Arc<SimMetrics>,
    state: Mutex<SimState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call(&self, method: &'static str, target: Option<String>) {
        self.metrics.record(&self.id, method, target);
        if !self.behaviour.latency.is_zero() {
            tokio::time::sleep(self.behaviour.latency).await;
        }
    }
}

/// Template catalogue every simulated datacenter offers: id, name, hypervisor.
const TEMPLATES: &[(&str, &str, u32)] = &[
    ("ubuntu-22.04", "Ubuntu 22.04 LTS", 4),
    ("ubuntu-22.04-hv", "Ubuntu 22.04 LTS", 3),
    ("debian-12", "Debian 12", 4),
    ("centos-7", "CentOS 7", 4),
    ("win2022", "Windows Server 2022", 3),
];

/// A fake datacenter holding its servers and jobs in memory.
#[derive(Debug, Clone)]
pub struct SimulatedCloud {
    inner: Arc<Inner>,
}

impl SimulatedCloud {
    pub fn new(id: impl Into<DatacenterId>) -> Self {
        Self::with_behaviour(id, SimBehaviour::default(), Arc::new(SimMetrics::default()))
    }

    pub fn with_behaviour(
        id: impl Into<DatacenterId>,
        behaviour: SimBehaviour,
        metrics: Arc<SimMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                behaviour,
                metrics,
                state: Mutex::new(SimState::default()),
            }),
        }
    }

    pub fn id(&self) -> &DatacenterId {
        &self.inner.id
    }

    pub fn metrics(&self) -> &Arc<SimMetrics> {
        &self.inner.metrics
    }

    /// Adds a finished server straight away, bypassing the job queue.
    pub fn add_server(&self, name: &str, variant: VmVariant, powered_on: bool) -> ServerId {
        let mut state = self.inner.state();
        state.next_server_id += 1;
        let server_id = state.next_server_id;
        let ip = state.allocate_ip();
        state.servers.insert(
            server_id,
            VmRef {
                server_id,
                name: name.to_string(),
                variant,
                template_id: "ubuntu-22.04".to_string(),
                ip_addresses: vec![ip],
                powered_on,
            },
        );
        server_id
    }

    pub fn servers(&self) -> Vec<VmRef> {
        self.inner.state().servers.values().cloned().collect()
    }

    pub fn server(&self, id: ServerId) -> Option<VmRef> {
        self.inner.state().servers.get(&id).cloned()
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.state().jobs.len()
    }

    fn power(&self, id: ServerId, on: bool, method: &'static str) -> Result<()> {
        if self.inner.behaviour.fail_power {
            return Err(ConsoleError::api(format!("{} refused for server {}", method, id)));
        }
        let mut state = self.inner.state();
        let server = state.server_mut(id)?;
        server.powered_on = on;
        let name = server.name.clone();
        state.add_job(&name, method, self.inner.behaviour.job_polls, JobEffect::Nothing);
        Ok(())
    }
}

#[async_trait]
impl CloudApi for SimulatedCloud {
    async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        self.inner.call("authenticate", Some(username.to_string())).await;
        let accepted = match &self.inner.behaviour.credentials {
            Some((user, pass)) => user == username && pass == password,
            None => !username.is_empty() && !password.is_empty(),
        };
        if accepted {
            Ok(())
        } else {
            Err(ConsoleError::Authentication(format!(
                "datacenter {} rejected user '{}'",
                self.inner.id, username
            )))
        }
    }

    fn endpoint(&self) -> String {
        format!("https://api.dc{}.cloud.example", self.inner.id)
    }

    async fn list_pending_jobs(&self) -> Result<Vec<PendingJob>> {
        self.inner.call("list_pending_jobs", None).await;
        let mut state = self.inner.state();
        state.tick();
        Ok(state
            .jobs
            .iter()
            .map(|job| PendingJob {
                job_id: job.id,
                server_name: job.server_name.clone(),
                operation: job.operation.to_string(),
            })
            .collect())
    }

    async fn find_job(&self, server_name: &str) -> Result<JobLookup> {
        self.inner.call("find_job", Some(server_name.to_string())).await;
        let mut state = self.inner.state();
        state.tick();
        Ok(state
            .jobs
            .iter()
            .find(|job| job.server_name == server_name)
            .map_or(JobLookup::NotFound, |job| JobLookup::Pending(job.id)))
    }

    async fn power_on(&self, id: ServerId) -> Result<()> {
        self.inner.call("power_on", Some(id.to_string())).await;
        self.power(id, true, "power_on")
    }

    async fn power_off(&self, id: ServerId) -> Result<()> {
        self.inner.call("power_off", Some(id.to_string())).await;
        self.power(id, false, "power_off")
    }

    async fn delete(&self, id: ServerId) -> Result<()> {
        self.inner.call("delete", Some(id.to_string())).await;
        let mut state = self.inner.state();
        let server = state
            .servers
            .remove(&id)
            .ok_or_else(|| ConsoleError::NotFound(format!("server {}", id)))?;
        if server.powered_on {
            state.servers.insert(id, server);
            return Err(ConsoleError::api(format!(
                "server {} must be powered off before it is deleted",
                id
            )));
        }
        state.add_job(&server.name, "delete", self.inner.behaviour.job_polls, JobEffect::Nothing);
        Ok(())
    }

    async fn query_vms(&self, pattern: Option<&str>) -> Result<Vec<VmRef>> {
        self.inner.call("query_vms", pattern.map(str::to_string)).await;
        let mut state = self.inner.state();
        let found: Vec<VmRef> = state
            .servers
            .values()
            .filter(|vm| pattern.map_or(true, |p| vm.name.contains(p)))
            .cloned()
            .collect();
        for vm in &found {
            if state.unobserved.remove(&vm.name) {
                self.inner.metrics.creation_observed();
            }
        }
        Ok(found)
    }

    async fn find_template(&self, name: &str, hypervisor: Option<u32>) -> Result<Vec<Template>> {
        self.inner.call("find_template", Some(name.to_string())).await;
        let needle = name.to_ascii_lowercase();
        Ok(TEMPLATES
            .iter()
            .filter(|(id, label, _)| {
                id.contains(&needle) || label.to_ascii_lowercase().contains(&needle)
            })
            .filter(|(_, _, hv)| hypervisor.map_or(true, |wanted| wanted == *hv))
            .map(|(id, label, hv)| Template {
                template_id: id.to_string(),
                name: label.to_string(),
                hypervisor: *hv,
            })
            .collect())
    }

    async fn purchase_public_ip(&self) -> Result<PublicIp> {
        self.inner.call("purchase_public_ip", None).await;
        let mut state = self.inner.state();
        let address = state.allocate_ip();
        let resource_id = format!("ip-{}", state.public_ips.len() + 1);
        state.public_ips.insert(resource_id.clone(), address.clone());
        Ok(PublicIp {
            resource_id,
            address,
        })
    }

    async fn refresh_server_list(&self) -> Result<()> {
        self.inner.call("refresh_server_list", None).await;
        Ok(())
    }

    fn new_creator(
        &self,
        variant: VmVariant,
        name: &str,
        template_id: &str,
        _admin_password: &str,
    ) -> Box<dyn VmCreator> {
        Box::new(SimulatedCreator {
            cloud: self.clone(),
            variant,
            name: name.to_string(),
            template_id: template_id.to_string(),
            package: None,
            cpu_count: 0,
            ram_gb: 0,
            disks_gb: Vec::new(),
            public_ip: None,
        })
    }
}

/// Creation request builder for [`SimulatedCloud`].
#[derive(Debug)]
pub struct SimulatedCreator {
    cloud: SimulatedCloud,
    variant: VmVariant,
    name: String,
    template_id: String,
    package: Option<PackageSize>,
    cpu_count: u32,
    ram_gb: u32,
    disks_gb: Vec<u32>,
    public_ip: Option<String>,
}

#[async_trait]
impl VmCreator for SimulatedCreator {
    fn set_package(&mut self, size: PackageSize) {
        self.package = Some(size);
    }

    fn set_cpu_count(&mut self, count: u32) {
        self.cpu_count = count;
    }

    fn set_ram_amount(&mut self, gigabytes: u32) {
        self.ram_gb = gigabytes;
    }

    fn attach_disk(&mut self, size_gb: u32) {
        self.disks_gb.push(size_gb);
    }

    fn attach_public_ip(&mut self, resource_id: &str) {
        self.public_ip = Some(resource_id.to_string());
    }

    async fn commit(&mut self, endpoint: &str) -> Result<bool> {
        let inner = &self.cloud.inner;
        inner.call("commit", Some(self.name.clone())).await;
        if endpoint != self.cloud.endpoint() {
            return Err(ConsoleError::api(format!("unknown endpoint {}", endpoint)));
        }

        if inner.behaviour.panic_commits {
            panic!("simulated commit of {} crashed", self.name);
        }
        inner.metrics.commit_started();
        if !inner.behaviour.commit_duration.is_zero() {
            tokio::time::sleep(inner.behaviour.commit_duration).await;
        }
        let accepted = !inner.behaviour.reject_commits && self.is_complete();
        if accepted {
            let mut state = inner.state();
            state.next_server_id += 1;
            let server_id = state.next_server_id;
            let mut ip_addresses = vec![state.allocate_ip()];
            ip_addresses.extend(
                self.public_ip
                    .as_ref()
                    .and_then(|id| state.public_ips.get(id).cloned()),
            );
            let vm = VmRef {
                server_id,
                name: self.name.clone(),
                variant: self.variant,
                template_id: self.template_id.clone(),
                ip_addresses,
                powered_on: true,
            };
            state.unobserved.insert(self.name.clone());
            inner.metrics.creation_started();
            state.add_job(&self.name, "create", inner.behaviour.job_polls, JobEffect::Provision(vm));
        }
        inner.metrics.commit_finished();
        Ok(accepted)
    }
}

impl SimulatedCreator {
    fn is_complete(&self) -> bool {
        match self.variant {
            VmVariant::Smart => self.package.is_some(),
            VmVariant::Pro => self.cpu_count > 0 && self.ram_gb > 0 && !self.disks_gb.is_empty(),
        }
    }
}

/// Hands out one [`SimulatedCloud`] per datacenter id, reusing it on re-login.
#[derive(Debug)]
pub struct SimulatedConnector {
    known: Option<BTreeSet<DatacenterId>>,
    behaviour: SimBehaviour,
    metrics: Arc<SimMetrics>,
    demo_servers: bool,
    clouds: Mutex<HashMap<DatacenterId, SimulatedCloud>>,
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new(SimBehaviour::default())
    }
}

impl SimulatedConnector {
    pub fn new(behaviour: SimBehaviour) -> Self {
        Self {
            known: None,
            behaviour,
            metrics: Arc::new(SimMetrics::default()),
            demo_servers: false,
            clouds: Mutex::new(HashMap::new()),
        }
    }

    /// Refuses to connect to any datacenter not in `ids`.
    pub fn restricted_to<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<DatacenterId>,
    {
        self.known = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Seeds every new datacenter with a few servers.
    pub fn with_demo_servers(mut self) -> Self {
        self.demo_servers = true;
        self
    }

    pub fn metrics(&self) -> &Arc<SimMetrics> {
        &self.metrics
    }

    pub fn cloud(&self, id: &DatacenterId) -> Option<SimulatedCloud> {
        self.clouds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Returns the cloud for `id`, creating it if needed.
    pub fn cloud_or_create(&self, id: &DatacenterId) -> Result<SimulatedCloud> {
        if let Some(known) = &self.known {
            if !known.contains(id) {
                return Err(ConsoleError::NotFound(format!("datacenter {}", id)));
            }
        }
        let mut clouds = self.clouds.lock().unwrap_or_else(PoisonError::into_inner);
        let cloud = clouds.entry(id.clone()).or_insert_with(|| {
            let cloud = SimulatedCloud::with_behaviour(
                id.clone(),
                self.behaviour.clone(),
                Arc::clone(&self.metrics),
            );
            if self.demo_servers {
                cloud.add_server("web-frontend", VmVariant::Pro, true);
                cloud.add_server("web-backend", VmVariant::Pro, true);
                cloud.add_server("db-primary", VmVariant::Smart, false);
            }
            cloud
        });
        Ok(cloud.clone())
    }
}

impl CloudConnector for SimulatedConnector {
    fn connect(&self, datacenter: &DatacenterId) -> Result<Arc<dyn CloudApi>> {
        Ok(Arc::new(self.cloud_or_create(datacenter)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_servers_appear_after_their_job_finishes() {
        let behaviour = SimBehaviour {
            job_polls: 2,
            ..SimBehaviour::default()
        };
        let cloud = SimulatedCloud::with_behaviour("1", behaviour, Arc::default());
        let mut creator = cloud.new_creator(VmVariant::Smart, "web", "tmpl", "pw");
        creator.set_package(PackageSize::Small);
        assert!(creator.commit(&cloud.endpoint()).await.unwrap());

        assert!(matches!(cloud.find_job("web").await.unwrap(), JobLookup::Pending(_)));
        assert!(cloud.query_vms(Some("web")).await.unwrap().is_empty());
        assert_eq!(cloud.find_job("web").await.unwrap(), JobLookup::NotFound);
        assert_eq!(cloud.query_vms(Some("web")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn creations_count_until_a_search_returns_them() {
        let cloud = SimulatedCloud::new("1");
        for name in ["a", "b"] {
            let mut creator = cloud.new_creator(VmVariant::Smart, name, "tmpl", "pw");
            creator.set_package(PackageSize::Small);
            assert!(creator.commit(&cloud.endpoint()).await.unwrap());
        }
        assert_eq!(cloud.find_job("a").await.unwrap(), JobLookup::NotFound);
        assert_eq!(cloud.query_vms(Some("a")).await.unwrap().len(), 1);

        let mut creator = cloud.new_creator(VmVariant::Smart, "c", "tmpl", "pw");
        creator.set_package(PackageSize::Small);
        assert!(creator.commit(&cloud.endpoint()).await.unwrap());
        assert_eq!(cloud.metrics().peak_concurrent_creations(), 2);
    }

    #[tokio::test]
    async fn templates_filter_by_name_and_hypervisor() {
        let cloud = SimulatedCloud::new("1");
        let ubuntu = cloud.find_template("ubuntu", None).await.unwrap();
        assert_eq!(ubuntu.len(), 2);

        let hyperv = cloud.find_template("Ubuntu", Some(3)).await.unwrap();
        assert_eq!(hyperv.len(), 1);
        assert_eq!(hyperv[0].template_id, "ubuntu-22.04-hv");

        assert!(cloud.find_template("freebsd", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn incomplete_creators_are_rejected() {
        let cloud = SimulatedCloud::new("1");
        let mut creator = cloud.new_creator(VmVariant::Pro, "db", "tmpl", "pw");
        creator.set_cpu_count(2);
        assert!(!creator.commit(&cloud.endpoint()).await.unwrap());
        assert_eq!(cloud.metrics().commit_count(), 1);
    }

    #[tokio::test]
    async fn powered_on_servers_cannot_be_deleted() {
        let cloud = SimulatedCloud::new("1");
        let id = cloud.add_server("web", VmVariant::Pro, true);
        assert!(cloud.delete(id).await.is_err());

        cloud.power_off(id).await.unwrap();
        cloud.delete(id).await.unwrap();
        assert!(cloud.server(id).is_none());
    }

    #[tokio::test]
    async fn credentials_can_be_pinned() {
        let behaviour = SimBehaviour {
            credentials: Some(("admin".into(), "s3cret".into())),
            ..SimBehaviour::default()
        };
        let cloud = SimulatedCloud::with_behaviour("1", behaviour, Arc::default());
        assert!(matches!(
            cloud.authenticate("admin", "wrong").await,
            Err(ConsoleError::Authentication(_))
        ));
        cloud.authenticate("admin", "s3cret").await.unwrap();
    }

    #[test]
    fn restricted_connector_refuses_unknown_datacenters() {
        let connector = SimulatedConnector::default().restricted_to(["1", "2"]);
        assert!(connector.connect(&DatacenterId::from("1")).is_ok());
        assert!(connector.connect(&DatacenterId::from("7")).is_err());
    }

    #[test]
    fn reconnecting_reuses_the_same_cloud() {
        let connector = SimulatedConnector::default().with_demo_servers();
        let id = DatacenterId::from("3");
        let first = connector.cloud_or_create(&id).unwrap();
        first.add_server("extra", VmVariant::Smart, true);
        let again = connector.cloud_or_create(&id).unwrap();
        assert_eq!(again.servers().len(), 4);
    }
}

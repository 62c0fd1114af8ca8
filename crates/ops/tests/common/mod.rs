//! In-memory WorkloadStore that records every call.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use knd_core::{
    build_service_spec, build_workload_spec, image_tag, Observed, ObservedService, ObservedWorkload, Operation,
    RemoteFailure, ResourceKind, ServiceSpec, StructuralPolicy, WorkloadSpec,
};
use knd_kubehub::{DeleteOptions, StoreResult, WorkloadStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetWorkload,
    GetService,
    CreateWorkload { replicas: i32, image: String },
    CreateService { port: i32 },
    PatchWorkload { replicas: i32, image: String },
    PatchService,
    DeleteWorkload { grace_period_seconds: u32 },
    DeleteService,
}

impl Call {
    pub fn is_write(&self) -> bool {
        !matches!(self, Call::GetWorkload | Call::GetService)
    }
}

type Key = (String, String);

#[derive(Default)]
struct State {
    workloads: BTreeMap<Key, ObservedWorkload>,
    services: BTreeMap<Key, ObservedService>,
    calls: Vec<Call>,
    failures: HashMap<(Operation, ResourceKind), RemoteFailure>,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

fn key(ns: &str, name: &str) -> Key {
    (ns.to_string(), name.to_string())
}

fn not_found(kind: ResourceKind, name: &str) -> RemoteFailure {
    RemoteFailure::new(Some(404), "NotFound", format!("{} {:?} not found", kind, name))
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workload(self, ns: &str, name: &str, replicas: i32, version: &str) -> Self {
        self.state.lock().unwrap().workloads.insert(
            key(ns, name),
            ObservedWorkload {
                namespace: ns.into(),
                name: name.into(),
                replicas,
                image: format!("nginx:{}", version),
                image_version: version.into(),
                generation: Some(1),
            },
        );
        self
    }

    pub fn with_service(self, ns: &str, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .services
            .insert(key(ns, name), ObservedService { namespace: ns.into(), name: name.into(), cluster_ip: None });
        self
    }

    pub fn fail_on(self, op: Operation, kind: ResourceKind, code: u16) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((op, kind), RemoteFailure::new(Some(code), "Injected", format!("injected {} {}", op, kind)));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn workload(&self, ns: &str, name: &str) -> Option<ObservedWorkload> {
        self.state.lock().unwrap().workloads.get(&key(ns, name)).cloned()
    }

    pub fn service(&self, ns: &str, name: &str) -> Option<ObservedService> {
        self.state.lock().unwrap().services.get(&key(ns, name)).cloned()
    }

    fn begin(&self, call: Call, op: Operation, kind: ResourceKind) -> StoreResult<std::sync::MutexGuard<'_, State>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(call);
        if let Some(f) = st.failures.get(&(op, kind)) {
            return Err(f.clone());
        }
        Ok(st)
    }
}

fn observed_from(ns: &str, spec: &WorkloadSpec, generation: i64) -> ObservedWorkload {
    let image = spec.image();
    ObservedWorkload {
        namespace: ns.into(),
        name: spec.name.clone(),
        replicas: spec.replicas,
        image_version: image_tag(&image).to_string(),
        image,
        generation: Some(generation),
    }
}

#[async_trait::async_trait]
impl WorkloadStore for FakeStore {
    async fn get_workload(&self, namespace: &str, name: &str) -> StoreResult<Observed<ObservedWorkload>> {
        let st = self.begin(Call::GetWorkload, Operation::Get, ResourceKind::Workload)?;
        Ok(st.workloads.get(&key(namespace, name)).cloned().into())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Observed<ObservedService>> {
        let st = self.begin(Call::GetService, Operation::Get, ResourceKind::Service)?;
        Ok(st.services.get(&key(namespace, name)).cloned().into())
    }

    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> StoreResult<ObservedWorkload> {
        let call = Call::CreateWorkload { replicas: spec.replicas, image: spec.image() };
        let mut st = self.begin(call, Operation::Create, ResourceKind::Workload)?;
        let k = key(namespace, &spec.name);
        if st.workloads.contains_key(&k) {
            return Err(RemoteFailure::new(Some(409), "AlreadyExists", "deployment already exists"));
        }
        let w = observed_from(namespace, spec, 1);
        st.workloads.insert(k, w.clone());
        Ok(w)
    }

    async fn create_service(&self, namespace: &str, spec: &ServiceSpec) -> StoreResult<ObservedService> {
        let mut st = self.begin(Call::CreateService { port: spec.port }, Operation::Create, ResourceKind::Service)?;
        let k = key(namespace, &spec.name);
        if st.services.contains_key(&k) {
            return Err(RemoteFailure::new(Some(409), "AlreadyExists", "service already exists"));
        }
        let s = ObservedService { namespace: namespace.into(), name: spec.name.clone(), cluster_ip: Some("10.96.0.10".into()) };
        st.services.insert(k, s.clone());
        Ok(s)
    }

    async fn patch_workload(&self, namespace: &str, spec: &WorkloadSpec) -> StoreResult<ObservedWorkload> {
        let call = Call::PatchWorkload { replicas: spec.replicas, image: spec.image() };
        let mut st = self.begin(call, Operation::Patch, ResourceKind::Workload)?;
        let k = key(namespace, &spec.name);
        let generation = match st.workloads.get(&k) {
            Some(w) => w.generation.unwrap_or(0) + 1,
            None => return Err(not_found(ResourceKind::Workload, &spec.name)),
        };
        let w = observed_from(namespace, spec, generation);
        st.workloads.insert(k, w.clone());
        Ok(w)
    }

    async fn patch_service(&self, namespace: &str, spec: &ServiceSpec) -> StoreResult<ObservedService> {
        let st = self.begin(Call::PatchService, Operation::Patch, ResourceKind::Service)?;
        st.services.get(&key(namespace, &spec.name)).cloned().ok_or_else(|| not_found(ResourceKind::Service, &spec.name))
    }

    async fn delete_workload(&self, namespace: &str, name: &str, opts: &DeleteOptions) -> StoreResult<()> {
        let call = Call::DeleteWorkload { grace_period_seconds: opts.grace_period_seconds };
        let mut st = self.begin(call, Operation::Delete, ResourceKind::Workload)?;
        st.workloads.remove(&key(namespace, name)).map(|_| ()).ok_or_else(|| not_found(ResourceKind::Workload, name))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut st = self.begin(Call::DeleteService, Operation::Delete, ResourceKind::Service)?;
        st.services.remove(&key(namespace, name)).map(|_| ()).ok_or_else(|| not_found(ResourceKind::Service, name))
    }
}

pub fn desired(replicas: i32, version: &str) -> (WorkloadSpec, ServiceSpec) {
    let p = StructuralPolicy::default();
    (
        build_workload_spec(&p, replicas, version, "web").expect("workload spec"),
        build_service_spec(&p, "web").expect("service spec"),
    )
}

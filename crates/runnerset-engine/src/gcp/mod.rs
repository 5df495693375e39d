//! GCP Compute Engine backend.
//!
//! Runs ephemeral runners as Compute Engine VMs. The JIT configuration is
//! passed through instance metadata under `ACTIONS_RUNNER_INPUT_JITCONFIG`;
//! a boot agent inside the runner image reads it and execs the runner.
//!
//! Instance insert and delete are long-running operations: the call returns
//! an operation handle, and the engine waits for the operation to reach its
//! terminal state before reporting success.

mod auth;
mod compute;

pub use compute::GcpApiError;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::gcp::compute::{
    AccessConfig, AttachedDisk, ComputeClient, Instance, InitializeParams, Metadata, MetadataItem,
    NetworkInterface, Operation, ServiceAccount,
};
use crate::{cancellable, Engine};

/// Default machine type for runner VMs.
pub const DEFAULT_MACHINE_TYPE: &str = "e2-medium";

/// Default boot disk size in GB.
pub const DEFAULT_DISK_SIZE_GB: i64 = 50;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JIT_CONFIG_METADATA_KEY: &str = "ACTIONS_RUNNER_INPUT_JITCONFIG";

/// GCP-specific engine settings.
///
/// Authentication uses Application Default Credentials; no credential
/// fields exist here.
#[derive(Debug, Clone)]
pub struct GcpConfig {
    /// GCP project id (required).
    pub project: String,

    /// Zone where runner VMs are created (required).
    pub zone: String,

    /// Compute Engine machine type.
    pub machine_type: String,

    /// Full self-link or family URL of the runner image (required), e.g.
    /// `projects/my-project/global/images/family/runnerset-runner`.
    pub image: String,

    /// Boot disk size in GB.
    pub disk_size_gb: i64,

    /// VPC network name.
    pub network: String,

    /// Subnetwork (optional). When empty the zone's default subnet is used.
    pub subnet: Option<String>,

    /// Whether runner VMs get an external IP.
    pub public_ip: bool,

    /// Service account email to attach to runner VMs (optional). When set,
    /// the VM is granted the cloud-platform scope.
    pub service_account: Option<String>,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            zone: String::new(),
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
            image: String::new(),
            disk_size_gb: DEFAULT_DISK_SIZE_GB,
            network: "default".to_string(),
            subnet: None,
            public_ip: true,
            service_account: None,
        }
    }
}

/// Internal seam over the compute REST surface, so the engine logic can be
/// exercised without a live project.
#[async_trait]
trait ComputeApi: Send + Sync {
    async fn insert_instance(&self, instance: &Instance)
        -> std::result::Result<Operation, GcpApiError>;
    async fn delete_instance(&self, name: &str) -> std::result::Result<Operation, GcpApiError>;
    async fn wait_operation(
        &self,
        context: &str,
        op: Operation,
    ) -> std::result::Result<(), GcpApiError>;
}

#[async_trait]
impl ComputeApi for ComputeClient {
    async fn insert_instance(
        &self,
        instance: &Instance,
    ) -> std::result::Result<Operation, GcpApiError> {
        ComputeClient::insert_instance(self, instance).await
    }

    async fn delete_instance(&self, name: &str) -> std::result::Result<Operation, GcpApiError> {
        ComputeClient::delete_instance(self, name).await
    }

    async fn wait_operation(
        &self,
        context: &str,
        op: Operation,
    ) -> std::result::Result<(), GcpApiError> {
        ComputeClient::wait_operation(self, context, op).await
    }
}

/// Manages runners as Compute Engine VMs.
pub struct GcpEngine {
    api: Box<dyn ComputeApi>,
    cfg: GcpConfig,

    /// Tracked VMs, runner name -> instance name. For this backend the
    /// instance name is the opaque id.
    instances: Mutex<HashMap<String, String>>,
}

impl GcpEngine {
    /// Creates a GCP engine using Application Default Credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials cannot be resolved from the
    /// environment.
    pub fn new(mut cfg: GcpConfig) -> Result<Self> {
        if cfg.machine_type.is_empty() {
            cfg.machine_type = DEFAULT_MACHINE_TYPE.to_string();
        }
        if cfg.disk_size_gb == 0 {
            cfg.disk_size_gb = DEFAULT_DISK_SIZE_GB;
        }
        if cfg.network.is_empty() {
            cfg.network = "default".to_string();
        }

        let client = ComputeClient::new(cfg.project.clone(), cfg.zone.clone())
            .map_err(|e| EngineError::Construction(e.to_string()))?;

        tracing::info!(
            project = %cfg.project,
            zone = %cfg.zone,
            machine_type = %cfg.machine_type,
            image = %cfg.image,
            "gcp engine initialized"
        );

        Ok(Self {
            api: Box::new(client),
            cfg,
            instances: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    fn with_api(cfg: GcpConfig, api: Box<dyn ComputeApi>) -> Self {
        Self {
            api,
            cfg,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn build_instance(&self, name: &str, jit_config: &str) -> Instance {
        let disk = AttachedDisk {
            auto_delete: true,
            boot: true,
            initialize_params: InitializeParams {
                source_image: self.cfg.image.clone(),
                disk_size_gb: self.cfg.disk_size_gb.to_string(),
                disk_type: format!("zones/{}/diskTypes/pd-ssd", self.cfg.zone),
            },
        };

        let nic = NetworkInterface {
            network: format!("global/networks/{}", self.cfg.network),
            subnetwork: self.cfg.subnet.clone(),
            access_configs: self.cfg.public_ip.then(|| {
                vec![AccessConfig {
                    name: "External NAT".to_string(),
                    kind: "ONE_TO_ONE_NAT".to_string(),
                }]
            }),
        };

        Instance {
            name: name.to_string(),
            machine_type: format!("zones/{}/machineTypes/{}", self.cfg.zone, self.cfg.machine_type),
            disks: vec![disk],
            network_interfaces: vec![nic],
            metadata: Metadata {
                items: vec![MetadataItem {
                    key: JIT_CONFIG_METADATA_KEY.to_string(),
                    value: jit_config.to_string(),
                }],
            },
            service_accounts: self.cfg.service_account.as_ref().map(|email| {
                vec![ServiceAccount {
                    email: email.clone(),
                    scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
                }]
            }),
        }
    }

    fn untrack(&self, id: &str) {
        let mut instances = self.lock();
        if let Some(name) = instances
            .iter()
            .find(|(_, instance)| instance.as_str() == id)
            .map(|(name, _)| name.clone())
        {
            instances.remove(&name);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Engine for GcpEngine {
    async fn start_runner(
        &self,
        cancel: &CancellationToken,
        name: &str,
        jit_config: &str,
    ) -> Result<String> {
        let instance = self.build_instance(name, jit_config);

        tracing::info!(
            name,
            machine_type = %self.cfg.machine_type,
            zone = %self.cfg.zone,
            "creating runner VM"
        );

        let op = cancellable(cancel, self.api.insert_instance(&instance)).await??;
        let context = format!("insert instance {name}");
        cancellable(cancel, self.api.wait_operation(&context, op)).await??;

        self.lock().insert(name.to_string(), name.to_string());

        tracing::info!(name, zone = %self.cfg.zone, "runner VM started");

        // The instance name is the opaque id.
        Ok(name.to_string())
    }

    /// Deletes the VM identified by `id`. Idempotent: deleting an
    /// already-deleted VM clears tracking and returns `Ok`.
    async fn destroy_runner(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        tracing::info!(name = %id, "destroying runner VM");

        let op = match cancellable(cancel, self.api.delete_instance(id)).await? {
            Ok(op) => op,
            Err(e) if e.is_not_found() => {
                tracing::info!(name = %id, "runner VM already deleted");
                self.untrack(id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let context = format!("delete instance {id}");
        match cancellable(cancel, self.api.wait_operation(&context, op)).await? {
            Ok(()) => {}
            // A delete/check race can also surface not-found from the wait.
            Err(e) if e.is_not_found() => {
                tracing::info!(name = %id, "runner VM already deleted");
            }
            Err(e) => return Err(e.into()),
        }

        self.untrack(id);
        tracing::info!(name = %id, "runner VM destroyed");
        Ok(())
    }

    /// Deletes every tracked VM. The reqwest client needs no explicit
    /// close; the credential cache is dropped with the engine.
    async fn shutdown(&self, cancel: &CancellationToken) -> Result<()> {
        let snapshot: Vec<(String, String)> = self
            .lock()
            .iter()
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect();

        let mut first_err = None;
        for (name, id) in snapshot {
            tracing::info!(name = %name, "shutdown: deleting runner VM");
            if let Err(e) = self.destroy_runner(cancel, &id).await {
                tracing::error!(name = %name, error = %e, "shutdown: failed to delete runner VM");
                first_err.get_or_insert(e);
            }
        }

        self.lock().clear();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn test_config() -> GcpConfig {
        GcpConfig {
            project: "test-project".to_string(),
            zone: "us-central1-a".to_string(),
            image: "projects/test-project/global/images/runner-image".to_string(),
            ..Default::default()
        }
    }

    fn done_op() -> Operation {
        Operation {
            name: "op-1".to_string(),
            status: "DONE".to_string(),
            error: None,
            http_error_status_code: None,
        }
    }

    /// Scripted compute API: per-call results plus a record of requests.
    #[derive(Default)]
    struct MockApi {
        insert_names: StdMutex<Vec<String>>,
        delete_names: StdMutex<Vec<String>>,
        delete_errors: StdMutex<HashMap<String, String>>,
        wait_error: Option<String>,
    }

    impl MockApi {
        fn fail_delete(&self, name: &str, message: &str) {
            self.delete_errors
                .lock()
                .unwrap()
                .insert(name.to_string(), message.to_string());
        }
    }

    #[async_trait]
    impl ComputeApi for MockApi {
        async fn insert_instance(
            &self,
            instance: &Instance,
        ) -> std::result::Result<Operation, GcpApiError> {
            self.insert_names.lock().unwrap().push(instance.name.clone());
            Ok(done_op())
        }

        async fn delete_instance(
            &self,
            name: &str,
        ) -> std::result::Result<Operation, GcpApiError> {
            self.delete_names.lock().unwrap().push(name.to_string());
            if let Some(message) = self.delete_errors.lock().unwrap().get(name) {
                return Err(GcpApiError::new(format!("delete instance {name}"), message));
            }
            Ok(done_op())
        }

        async fn wait_operation(
            &self,
            context: &str,
            _op: Operation,
        ) -> std::result::Result<(), GcpApiError> {
            match &self.wait_error {
                Some(message) => Err(GcpApiError::new(context, message.clone())),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn start_runner_tracks_instance_by_name() {
        let engine = GcpEngine::with_api(test_config(), Box::new(MockApi::default()));
        let cancel = CancellationToken::new();

        let id = engine
            .start_runner(&cancel, "runner-ab12cd34", "jit")
            .await
            .unwrap();

        assert_eq!(id, "runner-ab12cd34");
        assert_eq!(
            engine.lock().get("runner-ab12cd34").map(String::as_str),
            Some("runner-ab12cd34")
        );
    }

    #[tokio::test]
    async fn destroy_swallows_not_found_and_untracks() {
        let api = MockApi::default();
        api.fail_delete("vm-1", "googleapi: Error 404: not found");
        let engine = GcpEngine::with_api(test_config(), Box::new(api));
        engine.lock().insert("vm-1".to_string(), "vm-1".to_string());
        let cancel = CancellationToken::new();

        engine.destroy_runner(&cancel, "vm-1").await.unwrap();
        assert!(engine.lock().is_empty());
    }

    #[tokio::test]
    async fn destroy_swallows_not_found_during_wait() {
        let api = MockApi {
            wait_error: Some("rpc error: code = NotFound desc = gone".to_string()),
            ..Default::default()
        };
        let engine = GcpEngine::with_api(test_config(), Box::new(api));
        engine.lock().insert("vm-1".to_string(), "vm-1".to_string());
        let cancel = CancellationToken::new();

        engine.destroy_runner(&cancel, "vm-1").await.unwrap();
        assert!(engine.lock().is_empty());
    }

    #[tokio::test]
    async fn destroy_propagates_other_errors() {
        let api = MockApi::default();
        api.fail_delete("vm-1", "Error 403: quota exceeded");
        let engine = GcpEngine::with_api(test_config(), Box::new(api));
        engine.lock().insert("vm-1".to_string(), "vm-1".to_string());
        let cancel = CancellationToken::new();

        let err = engine.destroy_runner(&cancel, "vm-1").await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        // Failed destroys keep the entry tracked for shutdown.
        assert_eq!(engine.lock().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_attempts_all_and_returns_first_error() {
        let api = MockApi::default();
        api.fail_delete("vm-bad", "Error 500: backend error");
        let engine = GcpEngine::with_api(test_config(), Box::new(api));
        for name in ["vm-bad", "vm-ok-1", "vm-ok-2"] {
            engine.lock().insert(name.to_string(), name.to_string());
        }
        let cancel = CancellationToken::new();

        let err = engine.shutdown(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("backend error"));
        // Inventory ends empty regardless of the failure.
        assert!(engine.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_start() {
        let engine = GcpEngine::with_api(test_config(), Box::new(MockApi::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .start_runner(&cancel, "runner-ab12cd34", "jit")
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(engine.lock().is_empty());
    }

    #[test]
    fn instance_resource_shape() {
        let mut cfg = test_config();
        cfg.subnet = Some("regions/us-central1/subnetworks/runners".to_string());
        cfg.service_account = Some("runner@test-project.iam.gserviceaccount.com".to_string());
        let engine = GcpEngine::with_api(cfg, Box::new(MockApi::default()));

        let instance = engine.build_instance("runner-ab12cd34", "jit-blob");
        let json = serde_json::to_value(&instance).unwrap();

        assert_eq!(json["name"], "runner-ab12cd34");
        assert_eq!(
            json["machineType"],
            "zones/us-central1-a/machineTypes/e2-medium"
        );
        assert_eq!(json["disks"][0]["autoDelete"], true);
        assert_eq!(json["disks"][0]["boot"], true);
        assert_eq!(json["disks"][0]["initializeParams"]["diskSizeGb"], "50");
        assert_eq!(
            json["disks"][0]["initializeParams"]["diskType"],
            "zones/us-central1-a/diskTypes/pd-ssd"
        );
        assert_eq!(json["networkInterfaces"][0]["network"], "global/networks/default");
        assert_eq!(
            json["networkInterfaces"][0]["subnetwork"],
            "regions/us-central1/subnetworks/runners"
        );
        assert_eq!(
            json["networkInterfaces"][0]["accessConfigs"][0]["type"],
            "ONE_TO_ONE_NAT"
        );
        assert_eq!(
            json["networkInterfaces"][0]["accessConfigs"][0]["name"],
            "External NAT"
        );
        assert_eq!(
            json["metadata"]["items"][0]["key"],
            "ACTIONS_RUNNER_INPUT_JITCONFIG"
        );
        assert_eq!(json["metadata"]["items"][0]["value"], "jit-blob");
        assert_eq!(
            json["serviceAccounts"][0]["scopes"][0],
            "https://www.googleapis.com/auth/cloud-platform"
        );
    }

    #[test]
    fn instance_without_public_ip_has_no_access_configs() {
        let mut cfg = test_config();
        cfg.public_ip = false;
        let engine = GcpEngine::with_api(cfg, Box::new(MockApi::default()));

        let instance = engine.build_instance("runner-ab12cd34", "jit");
        let json = serde_json::to_value(&instance).unwrap();

        assert!(json["networkInterfaces"][0].get("accessConfigs").is_none());
        assert!(json["networkInterfaces"][0].get("subnetwork").is_none());
        assert!(json.get("serviceAccounts").is_none());
    }
}

//! Provision Service
//!
//! The front door: validates an [`InstallRequest`], registers a pending
//! operation, runs the matching flow on its own task and publishes the
//! outcome into the operation exactly once.
//!
//! ```text
//! install(request) ──► validate ──► new_operation ──► spawn ──► return Operation
//!                                                       │
//!                                  StateMachineExecutor ◄┘
//!                                          │
//!                            set_result / set_error(operation)
//! ```
//!
//! Callers follow the operation through the shared [`OperationManager`].

mod connector;
mod error;
mod progress;

use std::sync::Arc;
use std::time::Duration;

use provision_device::DeviceAdapter;
use provision_flows::{FlowContext, InstallRequest, build_flow};
use provision_lro::{Code, LroError, Operation, OperationManager, OperationStatus};
use provision_state_machine::{ExecutionResult, StateMachineExecutor};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub use connector::{DeviceConnector, SshConnector};
pub use error::ServiceError;

use progress::OperationProgress;

/// Reason attached to a flow that failed on its own.
pub const REASON_PROVISIONING_FAILED: &str = "PROVISIONING_FAILED";
/// Reason attached to a flow that ran past the flow timeout.
pub const REASON_PROVISIONING_TIMEDOUT: &str = "PROVISIONING_TIMEDOUT";

const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Runs provisioning requests as long-running operations.
pub struct ProvisionService {
  operations: OperationManager,
  connector: Arc<dyn DeviceConnector>,
  flow_timeout: Duration,
  shutdown: CancellationToken,
}

impl ProvisionService {
  pub fn new(operations: OperationManager, connector: Arc<dyn DeviceConnector>) -> Self {
    Self {
      operations,
      connector,
      flow_timeout: DEFAULT_FLOW_TIMEOUT,
      shutdown: CancellationToken::new(),
    }
  }

  /// Bound every flow run. The flow is cancelled when it elapses.
  pub fn with_flow_timeout(mut self, flow_timeout: Duration) -> Self {
    self.flow_timeout = flow_timeout;
    self
  }

  pub fn operations(&self) -> &OperationManager {
    &self.operations
  }

  /// Start provisioning and return the pending operation right away.
  ///
  /// Fails only when the request is malformed or the operation cannot be
  /// registered; every later failure is reported through the operation.
  /// Must be called from within a tokio runtime.
  #[instrument(name = "provision_install", skip(self, request), fields(target = request.target.kind()))]
  pub fn install(&self, request: InstallRequest) -> Result<Operation, ServiceError> {
    request.validate()?;

    let device = self.connector.connect(&request);
    let op = self.operations.new_operation()?;
    info!(operation = %op.name, target = request.target.kind(), "install_accepted");

    let run = FlowRun {
      operations: self.operations.clone(),
      name: op.name.clone(),
      timeout: self.flow_timeout,
      cancel: self.shutdown.child_token(),
    };
    tokio::spawn(run.run(request, device));

    Ok(op)
  }

  /// Cancel every running flow. Their operations complete with an error.
  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }
}

/// One spawned flow and the operation it reports into.
struct FlowRun {
  operations: OperationManager,
  name: String,
  timeout: Duration,
  cancel: CancellationToken,
}

impl FlowRun {
  #[instrument(name = "provision_flow", skip_all, fields(operation = %self.name))]
  async fn run(self, request: InstallRequest, device: Arc<dyn DeviceAdapter>) {
    let ctx = FlowContext::new(device, self.cancel.clone());
    let initial = build_flow(ctx, &request);
    let executor = StateMachineExecutor::with_notifier(OperationProgress::new(
      self.operations.clone(),
      self.name.clone(),
    ));

    let mut execution = std::pin::pin!(executor.execute(&self.name, initial, &self.cancel));
    let bounded = tokio::time::timeout(self.timeout, &mut execution).await;
    let (result, timed_out) = match bounded {
      Ok(result) => (result, false),
      Err(_) => {
        warn!(operation = %self.name, timeout_secs = self.timeout.as_secs(), "flow_timed_out");
        // Commands observe the token and unwind.
        self.cancel.cancel();
        (execution.await, true)
      }
    };

    self.publish(result, timed_out);
  }

  fn publish(&self, result: ExecutionResult, timed_out: bool) {
    let outcome = match result.error {
      None => self.operations.set_result(
        &self.name,
        json!({ "status": result.status, "metadata": result.metadata }),
      ),
      Some(error) => {
        let (code, reason, message) = if timed_out {
          (
            Code::DeadlineExceeded,
            REASON_PROVISIONING_TIMEDOUT,
            format!("provisioning timed out after {}s: {}", self.timeout.as_secs(), error),
          )
        } else {
          (Code::Aborted, REASON_PROVISIONING_FAILED, error.to_string())
        };
        let status = OperationStatus::new(code, message).with_detail(json!({
          "status": result.status,
          "reason": reason,
          "state": error.state(),
          "metadata": result.metadata,
        }));
        self.operations.set_error(&self.name, status)
      }
    };

    match outcome {
      Ok(()) => {}
      Err(LroError::NotFound { .. }) => {
        info!(operation = %self.name, "operation deleted before the flow finished");
      }
      Err(e) => warn!(operation = %self.name, error = %e, "failed to publish flow result"),
    }
  }
}

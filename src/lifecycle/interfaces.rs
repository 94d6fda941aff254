// ABOUTME: Well-known operation names and type markers used by the
// ABOUTME: lifecycle graph builders when wiring node bring-up and teardown

/// Type-hierarchy marker identifying host (compute) nodes.
pub const COMPUTE_TYPE: &str = "convoy.nodes.Compute";

/// Node property opting a host into agent provisioning.
pub const PROP_INSTALL_AGENT: &str = "install_agent";
/// Node property; `false` means the host cannot be reached directly and
/// agent restart/stop must go over the message broker.
pub const PROP_REMOTE_EXECUTION: &str = "remote_execution";

pub const LIFECYCLE_CREATE: &str = "convoy.interfaces.lifecycle.create";
pub const LIFECYCLE_CONFIGURE: &str = "convoy.interfaces.lifecycle.configure";
pub const LIFECYCLE_START: &str = "convoy.interfaces.lifecycle.start";
pub const LIFECYCLE_STOP: &str = "convoy.interfaces.lifecycle.stop";
pub const LIFECYCLE_DELETE: &str = "convoy.interfaces.lifecycle.delete";

pub const REL_PRECONFIGURE: &str = "convoy.interfaces.relationship_lifecycle.preconfigure";
pub const REL_POSTCONFIGURE: &str = "convoy.interfaces.relationship_lifecycle.postconfigure";
pub const REL_ESTABLISH: &str = "convoy.interfaces.relationship_lifecycle.establish";
pub const REL_UNLINK: &str = "convoy.interfaces.relationship_lifecycle.unlink";

/// Polled after start until the host reports itself up.
pub const HOST_GET_STATE: &str = "convoy.interfaces.host.get_state";

pub const MONITORING_START: &str = "convoy.interfaces.monitoring.start";
pub const MONITORING_STOP: &str = "convoy.interfaces.monitoring.stop";

pub const MONITORING_AGENT_INSTALL: &str = "convoy.interfaces.monitoring_agent.install";
pub const MONITORING_AGENT_START: &str = "convoy.interfaces.monitoring_agent.start";
pub const MONITORING_AGENT_STOP: &str = "convoy.interfaces.monitoring_agent.stop";
pub const MONITORING_AGENT_UNINSTALL: &str = "convoy.interfaces.monitoring_agent.uninstall";

// Current agent interface.
pub const AGENT_CREATE: &str = "convoy.interfaces.agent.create";
pub const AGENT_CONFIGURE: &str = "convoy.interfaces.agent.configure";
pub const AGENT_START: &str = "convoy.interfaces.agent.start";
pub const AGENT_STOP: &str = "convoy.interfaces.agent.stop";
pub const AGENT_DELETE: &str = "convoy.interfaces.agent.delete";
pub const AGENT_RESTART: &str = "convoy.interfaces.agent.restart";
pub const AGENT_RESTART_AMQP: &str = "convoy.interfaces.agent.restart_amqp";
pub const AGENT_STOP_AMQP: &str = "convoy.interfaces.agent.stop_amqp";
pub const AGENT_INSTALL_PLUGINS: &str = "convoy.interfaces.agent.install_plugins";

// Legacy agent interface, still honored when a node only declares these.
pub const WORKER_INSTALLER_INSTALL: &str = "convoy.interfaces.worker_installer.install";
pub const WORKER_INSTALLER_START: &str = "convoy.interfaces.worker_installer.start";
pub const WORKER_INSTALLER_RESTART: &str = "convoy.interfaces.worker_installer.restart";
pub const WORKER_INSTALLER_STOP: &str = "convoy.interfaces.worker_installer.stop";
pub const WORKER_INSTALLER_UNINSTALL: &str = "convoy.interfaces.worker_installer.uninstall";
pub const PLUGIN_INSTALLER_INSTALL: &str = "convoy.interfaces.plugin_installer.install";

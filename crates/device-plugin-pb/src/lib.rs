//! Generated kubelet device-plugin v1beta1 bindings plus the handful of
//! constants the API defines outside the proto file.

pub mod api {
    tonic::include_proto!("v1beta1");
}

/// API version reported during registration.
pub const VERSION: &str = "v1beta1";

/// Directory the kubelet expects device-plugin sockets in.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// The kubelet registration socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Health value for a usable device.
pub const HEALTHY: &str = "Healthy";

/// Health value for a device that must not be allocated.
pub const UNHEALTHY: &str = "Unhealthy";

//! Scenarios and fixtures for verifying the proxy, shared by the end-to-end
//! tests and the `tunprobe` CLI.

pub mod local;
pub mod scenario;
pub mod scope;

pub use scenario::{
	binary_executable, concurrent_echo, default_route_via_tun, echo_round_trip, ip_forward_enabled, masquerade_present,
	random_payload, ssh_reachable, sshd_running, tcp_echo_in, tools_present, tun_device_accessible, vpn_udp_echo,
};
pub use scope::with_environment;

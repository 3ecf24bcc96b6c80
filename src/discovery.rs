//! Service discovery glue (§4.7 "Discovery glue"). Bridges mDNS advertisements,
//! observed on an auxiliary thread owned by the discovery library, into connect
//! attempts on the dispatcher thread, and announces this endpoint's own presence
//! at startup.
use std::net::{IpAddr, SocketAddr};

use log::warn;

use crate::dispatcher::TaskSender;
use crate::endpoint::Endpoint;
use crate::sequencer::Sequencer;

/// Decides whether a discovered service should trigger an outbound invite.
/// The default policy connects to everything except ourselves, so a session
/// that observes its own mDNS announcement doesn't loop back and invite itself.
pub trait DiscoveryPolicy {
    fn should_connect(&self, name: &str) -> bool;
}

pub struct SkipSelf {
    pub own_name: String,
}

impl DiscoveryPolicy for SkipSelf {
    fn should_connect(&self, name: &str) -> bool {
        name != self.own_name
    }
}

/// Called from the discovery thread whenever a service is advertised. Enqueues
/// a task that, once dispatched on the core thread, invites the advertised
/// address (§6 "Discovery input": "enqueues a task that, when dispatched on the
/// core thread, calls `endpoint.connect`").
pub fn on_service_advertised<S, P>(sender: &TaskSender<Endpoint<S>>, policy: &P, address: IpAddr, port: u16, name: String)
where
    S: Sequencer + 'static,
    P: DiscoveryPolicy,
{
    if !policy.should_connect(&name) {
        return;
    }
    let addr = SocketAddr::new(address, port);
    sender.send(Box::new(move |endpoint, timers| {
        if let Err(e) = endpoint.invite_participant(addr, timers) {
            warn!("discovery: invite to {addr} ({name}) failed: {e}");
        }
    }));
}

/// Handle to an active mDNS advertisement of this endpoint; dropping it
/// unregisters the service.
#[cfg(feature = "mdns")]
pub struct MdnsAdvertisement {
    daemon: mdns_sd::ServiceDaemon,
    fullname: String,
}

#[cfg(feature = "mdns")]
impl MdnsAdvertisement {
    /// Registers `_apple-midi._udp.local.` for this instance (§4.7 "the core
    /// announces its own presence ... fire-and-forget at startup").
    pub fn announce(instance_name: &str, port: u16) -> Result<Self, mdns_sd::Error> {
        use mdns_sd::{ServiceDaemon, ServiceInfo};

        let daemon = ServiceDaemon::new()?;
        let service_type = "_apple-midi._udp.local.";
        let ip = local_ip_address::local_ip().map(|ip| ip.to_string()).unwrap_or_else(|e| {
            warn!("discovery: failed to determine local IP, advertising 0.0.0.0: {e}");
            "0.0.0.0".to_string()
        });
        let raw_hostname = hostname::get().map(|h| h.to_string_lossy().to_string()).unwrap_or_else(|e| {
            warn!("discovery: failed to read hostname, falling back to instance name: {e}");
            instance_name.to_string()
        });
        let hostname = format!("{raw_hostname}.local.");
        let service = ServiceInfo::new(service_type, instance_name, &hostname, ip, port, None)?;
        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;
        Ok(MdnsAdvertisement { daemon, fullname })
    }
}

#[cfg(feature = "mdns")]
impl Drop for MdnsAdvertisement {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("discovery: failed to unregister mdns service {}: {e:?}", self.fullname);
        }
    }
}

/// Listens for other `_apple-midi._udp.local.` instances on an auxiliary thread
/// and feeds each one through [`on_service_advertised`] (§4.7 "the wiring that
/// consumes a real mDNS implementation ... is in scope"). The mDNS protocol
/// implementation itself lives in `mdns-sd`, not here.
#[cfg(feature = "mdns")]
pub struct MdnsBrowser {
    _daemon: mdns_sd::ServiceDaemon,
}

#[cfg(feature = "mdns")]
impl MdnsBrowser {
    pub fn start<S, P>(sender: TaskSender<Endpoint<S>>, policy: P) -> Result<Self, mdns_sd::Error>
    where
        S: Sequencer + 'static,
        P: DiscoveryPolicy + Send + 'static,
    {
        let daemon = mdns_sd::ServiceDaemon::new()?;
        let receiver = daemon.browse("_apple-midi._udp.local.")?;
        std::thread::spawn(move || {
            for event in receiver.into_iter() {
                if let mdns_sd::ServiceEvent::ServiceResolved(info) = event {
                    let Some(addr) = info.get_addresses().iter().next() else {
                        continue;
                    };
                    let address: IpAddr = (*addr).into();
                    let name = info.get_fullname().to_string();
                    let port = info.get_port();
                    on_service_advertised(&sender, &policy, address, port, name);
                }
            }
        });
        Ok(MdnsBrowser { _daemon: daemon })
    }
}

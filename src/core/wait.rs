//! OF-015: Fixed-interval state-change polling.
//!
//! Asynchronous remote transitions (host monitoring, image copies,
//! marketplace enable/disable, VM lifecycle) are awaited with
//! [`StateChangeConf::wait`]: sleep `delay`, refresh, stop on a target
//! state, fail on a state outside pending and target, otherwise sleep
//! `min_interval` until the timeout.

use crate::api::{
    CloudApi, HostState, ImageState, LcmState, MarketplaceState, ObjectKind, RemoteObject,
    VmState,
};
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::template::DynTemplate;
use std::time::{Duration, Instant};

/// State reported when the object no longer exists.
pub const NOT_FOUND: &str = "notfound";

/// State reported by [`wait_for_deletion`] while the object still exists.
pub const PRESENT: &str = "present";

/// Poller pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub delay: Duration,
    pub min_interval: Duration,
}

impl Poll {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            delay: config.poll_delay()?,
            min_interval: config.poll_min_interval()?,
        })
    }

    /// No sleeping at all.
    pub fn immediate() -> Self {
        Self {
            delay: Duration::ZERO,
            min_interval: Duration::ZERO,
        }
    }
}

impl Default for Poll {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            min_interval: Duration::from_secs(3),
        }
    }
}

/// One refresh result: the state name, plus the remote error if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub state: String,
    pub detail: Option<String>,
}

impl Observed {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            detail: None,
        }
    }
}

/// A state-change wait.
#[derive(Debug, Clone)]
pub struct StateChangeConf<'a> {
    /// Object description used in errors and logs, e.g. `"image 4"`
    pub what: String,
    pub pending: &'a [&'a str],
    pub target: &'a [&'a str],
    pub poll: Poll,
    pub timeout: Duration,
}

impl StateChangeConf<'_> {
    /// Poll `refresh` until a target state is reached. `Ok(None)` from the
    /// refresh means the object is gone and is reported as [`NOT_FOUND`].
    pub fn wait<F>(&self, mut refresh: F) -> Result<String>
    where
        F: FnMut() -> Result<Option<Observed>>,
    {
        let start = Instant::now();
        if !self.poll.delay.is_zero() {
            std::thread::sleep(self.poll.delay);
        }

        loop {
            let observed = refresh()?.unwrap_or_else(|| Observed::new(NOT_FOUND));
            tracing::debug!(what = %self.what, state = %observed.state, "polled state");

            if self.target.contains(&observed.state.as_str()) {
                return Ok(observed.state);
            }
            if !self.pending.contains(&observed.state.as_str()) {
                return Err(Error::UnexpectedState {
                    what: self.what.clone(),
                    state: observed.state,
                    detail: observed.detail,
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(Error::Timeout {
                    what: self.what.clone(),
                    target: self.target.join("|"),
                    last: observed.state,
                    elapsed,
                });
            }
            let pause = self.poll.min_interval.min(self.timeout - elapsed);
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
    }
}

fn remote_error(object: &RemoteObject) -> Option<String> {
    object
        .template
        .parse::<DynTemplate>()
        .ok()
        .and_then(|t| t.get_str("ERROR").map(str::to_string))
}

/// Refresh closure over `info`, mapping not-found to `None`.
fn observe<'a, S>(
    api: &'a dyn CloudApi,
    kind: ObjectKind,
    id: u32,
    state_name: S,
) -> impl FnMut() -> Result<Option<Observed>> + 'a
where
    S: Fn(&RemoteObject) -> String + 'a,
{
    move || match api.info(kind, id) {
        Ok(object) => Ok(Some(Observed {
            state: state_name(&object),
            detail: remote_error(&object),
        })),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn name_or_unknown(name: Option<&'static str>) -> String {
    name.unwrap_or("UNKNOWN").to_string()
}

const HOST_PENDING: &[&str] = &[
    "INIT",
    "MONITORING_INIT",
    "MONITORING_MONITORED",
    "MONITORING_DISABLED",
];

/// Wait for a host to reach one of `target` (normally `MONITORED`).
pub fn wait_for_host_states(
    api: &dyn CloudApi,
    id: u32,
    poll: Poll,
    timeout: Duration,
    target: &[&str],
) -> Result<String> {
    let pending: Vec<&str> = HOST_PENDING
        .iter()
        .copied()
        .filter(|s| !target.contains(s))
        .collect();
    StateChangeConf {
        what: format!("host {}", id),
        pending: &pending,
        target,
        poll,
        timeout,
    }
    .wait(observe(api, ObjectKind::Host, id, |o| {
        name_or_unknown(HostState::from_code(o.state).map(HostState::name))
    }))
}

/// Wait for an image to finish copying or cloning.
pub fn wait_for_image_state(api: &dyn CloudApi, id: u32, poll: Poll, timeout: Duration) -> Result<String> {
    StateChangeConf {
        what: format!("image {}", id),
        pending: &["INIT", "LOCKED", "CLONE", "LOCKED_USED", "LOCKED_USED_PERS"],
        target: &["READY", "USED", "USED_PERS"],
        poll,
        timeout,
    }
    .wait(observe(api, ObjectKind::Image, id, |o| {
        name_or_unknown(ImageState::from_code(o.state).map(ImageState::name))
    }))
}

/// Wait for a marketplace to become enabled or disabled.
pub fn wait_for_marketplace_state(
    api: &dyn CloudApi,
    id: u32,
    poll: Poll,
    timeout: Duration,
    enabled: bool,
) -> Result<String> {
    let (pending, target) = if enabled {
        (["DISABLED"], ["ENABLED"])
    } else {
        (["ENABLED"], ["DISABLED"])
    };
    StateChangeConf {
        what: format!("marketplace {}", id),
        pending: &pending,
        target: &target,
        poll,
        timeout,
    }
    .wait(observe(api, ObjectKind::Marketplace, id, |o| {
        name_or_unknown(MarketplaceState::from_code(o.state).map(MarketplaceState::name))
    }))
}

/// VM state as the poller sees it: the LCM state while ACTIVE, the VM
/// state otherwise.
pub fn vm_state_name(object: &RemoteObject) -> String {
    if object.state == VmState::Active.code() {
        name_or_unknown(LcmState::from_code(object.lcm_state).map(LcmState::name))
    } else {
        name_or_unknown(VmState::from_code(object.state).map(VmState::name))
    }
}

/// Wait for a VM to reach one of `target`.
pub fn wait_for_vm_state(
    api: &dyn CloudApi,
    id: u32,
    poll: Poll,
    timeout: Duration,
    pending: &[&str],
    target: &[&str],
) -> Result<String> {
    StateChangeConf {
        what: format!("virtual machine {}", id),
        pending,
        target,
        poll,
        timeout,
    }
    .wait(observe(api, ObjectKind::VirtualMachine, id, vm_state_name))
}

/// Wait until `info` reports the object gone.
pub fn wait_for_deletion(
    api: &dyn CloudApi,
    kind: ObjectKind,
    id: u32,
    poll: Poll,
    timeout: Duration,
) -> Result<()> {
    StateChangeConf {
        what: format!("{} {}", kind, id),
        pending: &[PRESENT],
        target: &[NOT_FOUND],
        poll,
        timeout,
    }
    .wait(observe(api, kind, id, |_| PRESENT.to_string()))
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryCloud;
    use crate::api::{Action, AllocateRequest};
    use crate::error::ApiError;

    fn conf<'a>(pending: &'a [&'a str], target: &'a [&'a str], timeout: Duration) -> StateChangeConf<'a> {
        StateChangeConf {
            what: "thing 1".to_string(),
            pending,
            target,
            poll: Poll::immediate(),
            timeout,
        }
    }

    #[test]
    fn test_of015_reaches_target() {
        let mut states = vec!["LOCKED", "LOCKED", "READY"].into_iter();
        let result = conf(&["LOCKED"], &["READY"], Duration::from_secs(5))
            .wait(|| Ok(states.next().map(Observed::new)));
        assert_eq!(result.unwrap(), "READY");
        assert!(states.next().is_none());
    }

    #[test]
    fn test_of015_unexpected_state_carries_detail() {
        let err = conf(&["LOCKED"], &["READY"], Duration::from_secs(5))
            .wait(|| {
                Ok(Some(Observed {
                    state: "ERROR".to_string(),
                    detail: Some("copy failed".to_string()),
                }))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "thing 1 entered unexpected state ERROR: copy failed");
    }

    #[test]
    fn test_of015_not_found_is_a_state() {
        let result = conf(&["present"], &[NOT_FOUND], Duration::from_secs(5)).wait(|| Ok(None));
        assert_eq!(result.unwrap(), NOT_FOUND);
        let err = conf(&["LOCKED"], &["READY"], Duration::from_secs(5))
            .wait(|| Ok(None))
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedState { ref state, .. } if state == NOT_FOUND));
    }

    #[test]
    fn test_of015_timeout() {
        let mut polls = 0;
        let err = conf(&["LOCKED"], &["READY"], Duration::from_millis(20))
            .wait(|| {
                polls += 1;
                std::thread::sleep(Duration::from_millis(5));
                Ok(Some(Observed::new("LOCKED")))
            })
            .unwrap_err();
        assert!(polls >= 2);
        assert!(matches!(err, Error::Timeout { ref last, .. } if last == "LOCKED"));
    }

    #[test]
    fn test_of015_refresh_error_propagates() {
        let err = conf(&["A"], &["B"], Duration::from_secs(1))
            .wait(|| Err(ApiError::Backend("boom".to_string()).into()))
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_of015_poll_from_config() {
        let poll = Poll::from_config(&ProviderConfig::default()).unwrap();
        assert_eq!(poll, Poll::default());
    }

    #[test]
    fn test_of015_image_and_host_predicates() {
        let cloud = MemoryCloud::with_settle_polls(3);
        let ds = cloud
            .allocate(
                ObjectKind::Datastore,
                AllocateRequest::Template {
                    template: "NAME=\"img\"\nTYPE=\"IMAGE_DS\"".to_string(),
                    cluster_id: None,
                    datastore_id: None,
                },
            )
            .unwrap();
        let image = cloud
            .allocate(
                ObjectKind::Image,
                AllocateRequest::Template {
                    template: "NAME=\"base\"\nSIZE=\"128\"".to_string(),
                    cluster_id: None,
                    datastore_id: Some(ds),
                },
            )
            .unwrap();
        let state = wait_for_image_state(&cloud, image, Poll::immediate(), Duration::from_secs(5)).unwrap();
        assert_eq!(state, "READY");

        let host = cloud
            .allocate(
                ObjectKind::Host,
                AllocateRequest::Host {
                    name: "node1".to_string(),
                    im_mad: "kvm".to_string(),
                    vm_mad: "kvm".to_string(),
                    cluster_id: None,
                },
            )
            .unwrap();
        let state = wait_for_host_states(&cloud, host, Poll::immediate(), Duration::from_secs(5), &["MONITORED"]).unwrap();
        assert_eq!(state, "MONITORED");

        cloud.action(ObjectKind::Host, host, Action::Enable(false)).unwrap();
        let err = wait_for_host_states(&cloud, host, Poll::immediate(), Duration::from_secs(5), &["MONITORED"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_of015_image_error_reports_remote_message() {
        let cloud = MemoryCloud::new();
        let ds = cloud
            .allocate(
                ObjectKind::Datastore,
                AllocateRequest::Template {
                    template: "NAME=\"img\"".to_string(),
                    cluster_id: None,
                    datastore_id: None,
                },
            )
            .unwrap();
        let image = cloud
            .allocate(
                ObjectKind::Image,
                AllocateRequest::Template {
                    template: "NAME=\"bad\"\nPATH=\"/nope.qcow2\"".to_string(),
                    cluster_id: None,
                    datastore_id: Some(ds),
                },
            )
            .unwrap();
        cloud
            .force_state(ObjectKind::Image, image, ImageState::Error.code(), 0)
            .unwrap();
        cloud
            .set_template_value(ObjectKind::Image, image, "ERROR", "cannot fetch /nope.qcow2")
            .unwrap();
        let err = wait_for_image_state(&cloud, image, Poll::immediate(), Duration::from_secs(5)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "image 0 entered unexpected state ERROR: cannot fetch /nope.qcow2"
        );
    }

    #[test]
    fn test_of015_vm_and_deletion_predicates() {
        let cloud = MemoryCloud::new();
        let template_id = cloud
            .allocate(
                ObjectKind::Template,
                AllocateRequest::Template {
                    template: "NAME=\"t\"\nCPU=\"1\"\nMEMORY=\"128\"".to_string(),
                    cluster_id: None,
                    datastore_id: None,
                },
            )
            .unwrap();
        let vm = cloud
            .allocate(
                ObjectKind::VirtualMachine,
                AllocateRequest::Instantiate {
                    template_id,
                    name: String::new(),
                    hold: false,
                    extra: String::new(),
                },
            )
            .unwrap();
        let state = wait_for_vm_state(
            &cloud,
            vm,
            Poll::immediate(),
            Duration::from_secs(5),
            &["PENDING", "PROLOG", "BOOT", "LCM_INIT"],
            &["RUNNING"],
        )
        .unwrap();
        assert_eq!(state, "RUNNING");

        cloud.delete(ObjectKind::Template, template_id).unwrap();
        wait_for_deletion(&cloud, ObjectKind::Template, template_id, Poll::immediate(), Duration::from_secs(1)).unwrap();
    }
}

//! Admission decision engine.
//!
//! Evaluates the images of a pod against the configured [`PolicyConfig`]:
//! init-containers first, then containers, stopping at the first image that
//! floats on `latest` or comes from a registry outside the whitelist.

use crate::config::PolicyConfig;
use crate::image_reference::{ImageReference, ParseError};
use crate::matcher::{RegistryError, is_allowed, is_exempt};
use crate::notifier::{NotificationEvent, Notifier, NotifyError};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Container, Pod};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    InitContainer,
    Container,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::InitContainer => write!(f, "InitContainer"),
            ContainerKind::Container => write!(f, "Container"),
        }
    }
}

/// The parts of a pod the image policy looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmittedPod {
    pub name: String,
    pub namespace: String,
    pub init_images: Vec<String>,
    pub images: Vec<String>,
}

impl AdmittedPod {
    /// The request namespace takes precedence over the pod metadata. Pods created by a
    /// controller only carry `generateName` on CREATE, so the name falls back to it last.
    pub fn from_pod(pod: &Pod, request_namespace: Option<&str>, request_name: Option<&str>) -> Self {
        let namespace = request_namespace
            .filter(|ns| !ns.is_empty())
            .or(pod.metadata.namespace.as_deref())
            .unwrap_or_default()
            .to_string();
        let name = pod
            .metadata
            .name
            .as_deref()
            .or(request_name.filter(|name| !name.is_empty()))
            .or(pod.metadata.generate_name.as_deref())
            .unwrap_or_default()
            .to_string();

        let spec = pod.spec.as_ref();
        Self {
            name,
            namespace,
            init_images: container_images(spec.and_then(|s| s.init_containers.as_deref())),
            images: container_images(spec.map(|s| s.containers.as_slice())),
        }
    }
}

fn container_images(containers: Option<&[Container]>) -> Vec<String> {
    containers
        .unwrap_or_default()
        .iter()
        .map(|container| container.image.clone().unwrap_or_default())
        .collect()
}

/// Outcome of a policy evaluation. `reason` and `violating_image` are set iff the pod is denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub violating_image: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            violating_image: None,
        }
    }

    pub fn deny(reason: String, violating_image: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            violating_image: Some(violating_image.to_string()),
        }
    }
}

/// The request carries data the policy cannot be evaluated on. Not a policy rejection.
#[derive(Debug)]
pub enum AdmissionError {
    InvalidImage {
        kind: ContainerKind,
        image: String,
        source: ParseError,
    },
    UnresolvedRegistry {
        kind: ContainerKind,
        image: String,
        source: RegistryError,
    },
}

impl std::error::Error for AdmissionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdmissionError::InvalidImage { source, .. } => Some(source),
            AdmissionError::UnresolvedRegistry { source, .. } => Some(source),
        }
    }
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::InvalidImage {
                kind,
                image,
                source,
            } => write!(f, "Error while parsing {} image {:?}: {}", kind, image, source),
            AdmissionError::UnresolvedRegistry {
                kind,
                image,
                source,
            } => write!(
                f,
                "Error while looking for the registry of {} image {:?}: {}",
                kind, image, source
            ),
        }
    }
}

/// Evaluates the image policy without side effects.
pub fn evaluate(pod: &AdmittedPod, policy: &PolicyConfig) -> Result<Verdict, AdmissionError> {
    if is_exempt(&pod.namespace, &policy.whitelisted_namespaces) {
        info!("Namespace {} is whitelisted, skipping image checks", pod.namespace);
        return Ok(Verdict::allow());
    }

    if let Some(verdict) = check_images(ContainerKind::InitContainer, &pod.init_images, policy)? {
        return Ok(verdict);
    }
    if let Some(verdict) = check_images(ContainerKind::Container, &pod.images, policy)? {
        return Ok(verdict);
    }

    Ok(Verdict::allow())
}

/// Returns the verdict for the first violating image, `None` if all images comply.
fn check_images(
    kind: ContainerKind,
    images: &[String],
    policy: &PolicyConfig,
) -> Result<Option<Verdict>, AdmissionError> {
    for image in images {
        let reference =
            ImageReference::parse(image).map_err(|source| AdmissionError::InvalidImage {
                kind,
                image: image.clone(),
                source,
            })?;
        debug!(
            "Checking {} image {} resolved to {} (implicit tag: {})",
            kind, image, reference, reference.implicit_tag
        );

        if reference.uses_latest_tag() {
            let reason = format!("{} image using latest tag is not allowed: {}", kind, image);
            return Ok(Some(Verdict::deny(reason, image)));
        }

        if policy.restricts_registries() {
            let allowed = is_allowed(&reference, &policy.whitelisted_registries).map_err(
                |source| AdmissionError::UnresolvedRegistry {
                    kind,
                    image: image.clone(),
                    source,
                },
            )?;
            if !allowed {
                let reason = format!(
                    "{} image from a non-whitelisted registry: {}",
                    kind, image
                );
                return Ok(Some(Verdict::deny(reason, image)));
            }
        }
    }
    Ok(None)
}

/// Evaluates the image policy and sends one notification if the pod is denied.
///
/// The notification is bounded by `notify_timeout`; its outcome is logged and never
/// changes the verdict.
pub async fn decide<N: Notifier>(
    pod: &AdmittedPod,
    policy: &PolicyConfig,
    notifier: &N,
    notify_timeout: Duration,
) -> Result<Verdict, AdmissionError> {
    let verdict = evaluate(pod, policy)?;

    if let (false, Some(reason), Some(violating_image)) =
        (verdict.allowed, &verdict.reason, &verdict.violating_image)
    {
        let event = NotificationEvent {
            pod_name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            violating_image: violating_image.clone(),
            reason: reason.clone(),
            images: pod.images.clone(),
            init_images: pod.init_images.clone(),
            rejected_at: Utc::now(),
        };
        send_notification(notifier, &event, notify_timeout).await;
    }

    Ok(verdict)
}

async fn send_notification<N: Notifier>(
    notifier: &N,
    event: &NotificationEvent,
    timeout: Duration,
) {
    let result = match tokio::time::timeout(timeout, notifier.notify(event)).await {
        Ok(result) => result,
        Err(_) => Err(NotifyError::Timeout(timeout)),
    };
    if let Err(e) = result {
        warn!(
            "Failed to send rejection notification for pod {} in namespace {}: {}",
            event.pod_name, event.namespace, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::testing::{FailingNotifier, RecordingNotifier, StalledNotifier};
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn pod(namespace: &str, init_images: &[&str], images: &[&str]) -> AdmittedPod {
        AdmittedPod {
            name: "web".to_string(),
            namespace: namespace.to_string(),
            init_images: init_images.iter().map(|i| i.to_string()).collect(),
            images: images.iter().map(|i| i.to_string()).collect(),
        }
    }

    fn policy(namespaces: &[&str], registries: &[&str]) -> PolicyConfig {
        PolicyConfig::new(namespaces.iter(), registries.iter())
    }

    #[test]
    fn test_whitelisted_namespace_is_allowed() {
        let verdict = evaluate(
            &pod("kube-system", &[], &["nginx"]),
            &policy(&["kube-system"], &[]),
        )
        .unwrap();
        assert_eq!(verdict, Verdict::allow());
    }

    #[test]
    fn test_whitelisted_namespace_skips_malformed_images() {
        let verdict = evaluate(
            &pod("kube-system", &["Not An Image"], &[""]),
            &policy(&["kube-system"], &["myregistry.io"]),
        )
        .unwrap();
        assert!(verdict.allowed);
    }

    #[test]
    fn test_image_without_tag_is_denied() {
        let verdict = evaluate(&pod("default", &[], &["nginx"]), &policy(&[], &[])).unwrap();

        assert!(!verdict.allowed);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("Container image using latest tag is not allowed: nginx")
        );
        assert_eq!(verdict.violating_image.as_deref(), Some("nginx"));
    }

    #[test]
    fn test_explicit_latest_tag_is_denied() {
        let verdict = evaluate(
            &pod("default", &[], &["myregistry.io/app:latest"]),
            &policy(&[], &["myregistry.io"]),
        )
        .unwrap();
        assert!(verdict.reason.unwrap().contains("latest tag"));
    }

    #[test]
    fn test_tagged_image_from_whitelisted_registry_is_allowed() {
        let verdict = evaluate(
            &pod("default", &[], &["myregistry.io/app:v1.2"]),
            &policy(&[], &["myregistry.io"]),
        )
        .unwrap();
        assert_eq!(verdict, Verdict::allow());
    }

    #[test]
    fn test_tagged_images_without_registry_whitelist_are_allowed() {
        let verdict = evaluate(
            &pod("default", &["busybox:1.36"], &["nginx:1.27", "quay.io/org/app:3"]),
            &policy(&["kube-system"], &[]),
        )
        .unwrap();
        assert!(verdict.allowed);
    }

    #[test]
    fn test_digest_pinned_image_is_allowed() {
        let image = "nginx@sha256:6c3c624b58dbbcd3c0dd82b4c53f04194d1247c6eebdaab7c610cf7d66709b3b";
        let verdict = evaluate(&pod("default", &[], &[image]), &policy(&[], &[])).unwrap();
        assert!(verdict.allowed);
    }

    #[test]
    fn test_image_from_non_whitelisted_registry_is_denied() {
        let verdict = evaluate(
            &pod("default", &[], &["docker.io/app:v1"]),
            &policy(&[], &["myregistry.io"]),
        )
        .unwrap();

        assert!(!verdict.allowed);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("Container image from a non-whitelisted registry: docker.io/app:v1")
        );
    }

    #[test]
    fn test_init_container_is_reported_before_container() {
        let verdict = evaluate(
            &pod("default", &["busybox"], &["nginx"]),
            &policy(&[], &[]),
        )
        .unwrap();
        assert_eq!(
            verdict.reason.as_deref(),
            Some("InitContainer image using latest tag is not allowed: busybox")
        );
    }

    #[test]
    fn test_first_violation_wins() {
        let verdict = evaluate(
            &pod("default", &[], &["docker.io/app:v1", "nginx"]),
            &policy(&[], &["myregistry.io"]),
        )
        .unwrap();
        let reason = verdict.reason.unwrap();
        assert!(reason.contains("docker.io/app:v1"));
        assert!(!reason.contains("nginx"));
    }

    #[test]
    fn test_violation_stops_before_malformed_image() {
        let verdict = evaluate(&pod("default", &[], &["nginx", ""]), &policy(&[], &[])).unwrap();
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_malformed_image_is_an_input_error() {
        let err = evaluate(&pod("default", &[], &[""]), &policy(&[], &[])).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::InvalidImage {
                kind: ContainerKind::Container,
                source: ParseError::Empty,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_init_image_is_an_input_error() {
        let err = evaluate(&pod("default", &["nginx:"], &["nginx:1.27"]), &policy(&[], &[]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error while parsing InitContainer image \"nginx:\": invalid image format: nginx:"
        );
    }

    #[test]
    fn test_pod_without_containers_is_allowed() {
        let verdict = evaluate(&pod("default", &[], &[]), &policy(&[], &["myregistry.io"])).unwrap();
        assert!(verdict.allowed);
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let pod = pod("default", &["busybox:1.36"], &["docker.io/app:v1"]);
        let policy = policy(&[], &["myregistry.io"]);
        assert_eq!(evaluate(&pod, &policy).unwrap(), evaluate(&pod, &policy).unwrap());
    }

    #[tokio::test]
    async fn test_decide_notifies_once_on_denial() {
        let notifier = RecordingNotifier::default();
        let pod = pod("default", &["busybox:1.36"], &["nginx", "redis"]);

        let verdict = decide(&pod, &policy(&[], &[]), &notifier, TIMEOUT).await.unwrap();

        assert!(!verdict.allowed);
        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pod_name, "web");
        assert_eq!(events[0].namespace, "default");
        assert_eq!(events[0].violating_image, "nginx");
        assert_eq!(events[0].images, vec!["nginx", "redis"]);
        assert_eq!(events[0].init_images, vec!["busybox:1.36"]);
        assert_eq!(Some(events[0].reason.clone()), verdict.reason);
    }

    #[tokio::test]
    async fn test_decide_does_not_notify_on_allow() {
        let notifier = RecordingNotifier::default();

        let verdict = decide(
            &pod("default", &[], &["myregistry.io/app:v1.2"]),
            &policy(&[], &["myregistry.io"]),
            &notifier,
            TIMEOUT,
        )
        .await
        .unwrap();

        assert!(verdict.allowed);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_decide_does_not_notify_for_whitelisted_namespace() {
        let notifier = RecordingNotifier::default();

        let verdict = decide(
            &pod("kube-system", &[], &["nginx"]),
            &policy(&["kube-system"], &[]),
            &notifier,
            TIMEOUT,
        )
        .await
        .unwrap();

        assert!(verdict.allowed);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_decide_does_not_notify_on_input_error() {
        let notifier = RecordingNotifier::default();

        let result = decide(&pod("default", &[], &[""]), &policy(&[], &[]), &notifier, TIMEOUT).await;

        assert!(result.is_err());
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_notifier_failure_keeps_verdict() {
        let verdict = decide(
            &pod("default", &[], &["nginx"]),
            &policy(&[], &[]),
            &FailingNotifier,
            TIMEOUT,
        )
        .await
        .unwrap();

        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("nginx"));
    }

    #[tokio::test]
    async fn test_stalled_notifier_is_abandoned() {
        let started = Instant::now();

        let verdict = decide(
            &pod("default", &[], &["nginx"]),
            &policy(&[], &[]),
            &StalledNotifier,
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        assert!(!verdict.allowed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_admitted_pod_from_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                generate_name: Some("web-7d4b9c-".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                init_containers: Some(vec![Container {
                    name: "init".to_string(),
                    image: Some("busybox:1.36".to_string()),
                    ..Default::default()
                }]),
                containers: vec![
                    Container {
                        name: "app".to_string(),
                        image: Some("myregistry.io/app:v1.2".to_string()),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".to_string(),
                        image: None,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };

        let admitted = AdmittedPod::from_pod(&pod, Some("default"), None);

        assert_eq!(
            admitted,
            AdmittedPod {
                name: "web-7d4b9c-".to_string(),
                namespace: "default".to_string(),
                init_images: vec!["busybox:1.36".to_string()],
                images: vec!["myregistry.io/app:v1.2".to_string(), String::new()],
            }
        );
    }

    #[test]
    fn test_admitted_pod_prefers_metadata_name_and_falls_back_to_metadata_namespace() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let admitted = AdmittedPod::from_pod(&pod, Some(""), Some("ignored"));

        assert_eq!(admitted.name, "web");
        assert_eq!(admitted.namespace, "team-a");
        assert!(admitted.images.is_empty());
        assert!(admitted.init_images.is_empty());
    }
}

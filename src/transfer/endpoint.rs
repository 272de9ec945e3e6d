//! Transfer endpoint parsing
//!
//! Endpoints are URL-shaped strings naming one of the four environments:
//! `ssh://[user@]host[:port][/path]`, `docker://container[:path]`,
//! `k8s://[namespace/]pod[:path]`, the `pod:name[:path]` shorthand, or a
//! bare local path.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// One side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Local filesystem path.
    Local {
        /// Absolute or cwd-relative path.
        path: PathBuf,
    },
    /// Remote host over SSH.
    Ssh {
        user: Option<String>,
        host: String,
        port: Option<u16>,
        path: String,
    },
    /// Docker container.
    Docker { container: String, path: String },
    /// Kubernetes pod.
    K8s {
        namespace: Option<String>,
        pod: String,
        path: String,
    },
}

impl Endpoint {
    /// Parse one endpoint string.
    pub fn parse(input: &str) -> Result<Endpoint> {
        if let Some(rest) = input.strip_prefix("ssh://") {
            return parse_ssh(rest);
        }
        if let Some(rest) = input.strip_prefix("docker://") {
            return parse_docker(rest);
        }
        if let Some(rest) = input.strip_prefix("k8s://") {
            return parse_k8s(rest);
        }
        if let Some(rest) = input.strip_prefix("pod:") {
            return parse_pod_shorthand(rest);
        }
        Ok(Endpoint::Local {
            path: PathBuf::from(input),
        })
    }

    /// Environment kind, for dispatch and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Endpoint::Local { .. } => "local",
            Endpoint::Ssh { .. } => "ssh",
            Endpoint::Docker { .. } => "docker",
            Endpoint::K8s { .. } => "k8s",
        }
    }

    /// The in-environment path.
    pub fn path_str(&self) -> String {
        match self {
            Endpoint::Local { path } => path.to_string_lossy().into_owned(),
            Endpoint::Ssh { path, .. } => path.clone(),
            Endpoint::Docker { path, .. } => path.clone(),
            Endpoint::K8s { path, .. } => path.clone(),
        }
    }

    /// Whether two endpoints address the same environment instance
    /// (same host, container, or pod), enabling native `cp`/`mv`.
    pub fn same_instance(&self, other: &Endpoint) -> bool {
        match (self, other) {
            (Endpoint::Local { .. }, Endpoint::Local { .. }) => true,
            (
                Endpoint::Ssh {
                    user: u1,
                    host: h1,
                    port: p1,
                    ..
                },
                Endpoint::Ssh {
                    user: u2,
                    host: h2,
                    port: p2,
                    ..
                },
            ) => u1 == u2 && h1 == h2 && p1.unwrap_or(22) == p2.unwrap_or(22),
            (
                Endpoint::Docker { container: c1, .. },
                Endpoint::Docker { container: c2, .. },
            ) => c1 == c2,
            (
                Endpoint::K8s {
                    namespace: n1,
                    pod: pod1,
                    ..
                },
                Endpoint::K8s {
                    namespace: n2,
                    pod: pod2,
                    ..
                },
            ) => n1 == n2 && pod1 == pod2,
            _ => false,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Local { path } => write!(f, "{}", path.display()),
            Endpoint::Ssh {
                user, host, port, path,
            } => {
                write!(f, "ssh://")?;
                if let Some(user) = user {
                    write!(f, "{}@", user)?;
                }
                write!(f, "{}", host)?;
                if let Some(port) = port {
                    write!(f, ":{}", port)?;
                }
                write!(f, "{}", path)
            }
            Endpoint::Docker { container, path } => {
                write!(f, "docker://{}:{}", container, path)
            }
            Endpoint::K8s {
                namespace,
                pod,
                path,
            } => {
                write!(f, "k8s://")?;
                if let Some(ns) = namespace {
                    write!(f, "{}/", ns)?;
                }
                write!(f, "{}:{}", pod, path)
            }
        }
    }
}

fn parse_ssh(rest: &str) -> Result<Endpoint> {
    if rest.is_empty() {
        return Err(bad("ssh endpoint is empty"));
    }
    let (user, rest) = match rest.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some((_, rest)) => (None, rest),
        None => (None, rest),
    };

    // Authority ends at the first '/' (URL form) or at a ':' followed by
    // a path (scp form, `host:/path`).
    let (authority, path) = match rest.find(['/', ':']) {
        Some(idx) => {
            let (auth, tail) = rest.split_at(idx);
            match tail.as_bytes()[0] {
                b'/' => (auth, tail.to_string()),
                _ => {
                    // ':' — a port when digits follow and another
                    // separator comes later, else the path separator.
                    let after = &tail[1..];
                    let port_end = after
                        .find(['/', ':'])
                        .unwrap_or(after.len());
                    let candidate = &after[..port_end];
                    if !candidate.is_empty() && candidate.bytes().all(|b| b.is_ascii_digit())
                    {
                        let port: u16 = candidate
                            .parse()
                            .map_err(|_| bad("ssh port out of range"))?;
                        let tail = &after[port_end..];
                        let path = tail.trim_start_matches(':').to_string();
                        return finish_ssh(user, auth, Some(port), path);
                    }
                    (auth, after.to_string())
                }
            }
        }
        None => (rest, String::new()),
    };
    finish_ssh(user, authority, None, path)
}

fn finish_ssh(
    user: Option<String>,
    host: &str,
    port: Option<u16>,
    path: String,
) -> Result<Endpoint> {
    if host.is_empty() {
        return Err(bad("ssh endpoint has no host"));
    }
    Ok(Endpoint::Ssh {
        user,
        host: host.to_string(),
        port,
        path,
    })
}

fn parse_docker(rest: &str) -> Result<Endpoint> {
    let (container, path) = match rest.split_once(':') {
        Some((container, path)) => (container, path.to_string()),
        None => (rest, String::new()),
    };
    if container.is_empty() {
        return Err(bad("docker endpoint has no container"));
    }
    Ok(Endpoint::Docker {
        container: container.to_string(),
        path,
    })
}

fn parse_k8s(rest: &str) -> Result<Endpoint> {
    let (scope, path) = match rest.split_once(':') {
        Some((scope, path)) => (scope, path.to_string()),
        None => (rest, String::new()),
    };
    let (namespace, pod) = match scope.split_once('/') {
        Some((ns, pod)) => (Some(ns.to_string()), pod),
        None => (None, scope),
    };
    if pod.is_empty() {
        return Err(bad("k8s endpoint has no pod"));
    }
    Ok(Endpoint::K8s {
        namespace,
        pod: pod.to_string(),
        path,
    })
}

fn parse_pod_shorthand(rest: &str) -> Result<Endpoint> {
    let (pod, path) = match rest.split_once(':') {
        Some((pod, path)) => (pod, path.to_string()),
        None => (rest, String::new()),
    };
    if pod.is_empty() {
        return Err(bad("pod shorthand has no pod name"));
    }
    Ok(Endpoint::K8s {
        namespace: None,
        pod: pod.to_string(),
        path,
    })
}

fn bad(reason: &str) -> Error {
    Error::adapter("transfer", reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_paths() {
        assert_eq!(
            Endpoint::parse("/tmp/file").unwrap(),
            Endpoint::Local {
                path: PathBuf::from("/tmp/file")
            }
        );
        assert_eq!(
            Endpoint::parse("relative/dir").unwrap().kind(),
            "local"
        );
    }

    #[test]
    fn test_ssh_url_forms() {
        assert_eq!(
            Endpoint::parse("ssh://deploy@web-1:2222/var/www").unwrap(),
            Endpoint::Ssh {
                user: Some("deploy".into()),
                host: "web-1".into(),
                port: Some(2222),
                path: "/var/www".into(),
            }
        );
        assert_eq!(
            Endpoint::parse("ssh://web-1/etc/hosts").unwrap(),
            Endpoint::Ssh {
                user: None,
                host: "web-1".into(),
                port: None,
                path: "/etc/hosts".into(),
            }
        );
        // scp-style colon before the path.
        assert_eq!(
            Endpoint::parse("ssh://user@host:/tmp/b").unwrap(),
            Endpoint::Ssh {
                user: Some("user".into()),
                host: "host".into(),
                port: None,
                path: "/tmp/b".into(),
            }
        );
        // Port plus scp-style path.
        assert_eq!(
            Endpoint::parse("ssh://user@host:22:/tmp/b").unwrap(),
            Endpoint::Ssh {
                user: Some("user".into()),
                host: "host".into(),
                port: Some(22),
                path: "/tmp/b".into(),
            }
        );
        // Bare host, no path: resolved later by the host resolver.
        assert_eq!(
            Endpoint::parse("ssh://bastion").unwrap(),
            Endpoint::Ssh {
                user: None,
                host: "bastion".into(),
                port: None,
                path: String::new(),
            }
        );
    }

    #[test]
    fn test_docker_form() {
        assert_eq!(
            Endpoint::parse("docker://app:/srv/data").unwrap(),
            Endpoint::Docker {
                container: "app".into(),
                path: "/srv/data".into(),
            }
        );
        assert!(Endpoint::parse("docker://").is_err());
    }

    #[test]
    fn test_k8s_forms() {
        assert_eq!(
            Endpoint::parse("k8s://staging/web-1:/var/log").unwrap(),
            Endpoint::K8s {
                namespace: Some("staging".into()),
                pod: "web-1".into(),
                path: "/var/log".into(),
            }
        );
        assert_eq!(
            Endpoint::parse("k8s://web-1:/data").unwrap(),
            Endpoint::K8s {
                namespace: None,
                pod: "web-1".into(),
                path: "/data".into(),
            }
        );
        assert_eq!(
            Endpoint::parse("pod:web-1:/data").unwrap(),
            Endpoint::K8s {
                namespace: None,
                pod: "web-1".into(),
                path: "/data".into(),
            }
        );
    }

    #[test]
    fn test_same_instance() {
        let a = Endpoint::parse("ssh://u@h/x").unwrap();
        let b = Endpoint::parse("ssh://u@h:22/y").unwrap();
        let c = Endpoint::parse("ssh://u@other/x").unwrap();
        assert!(a.same_instance(&b), "default port equals explicit 22");
        assert!(!a.same_instance(&c));

        let d1 = Endpoint::parse("docker://app:/a").unwrap();
        let d2 = Endpoint::parse("docker://app:/b").unwrap();
        assert!(d1.same_instance(&d2));
        assert!(!d1.same_instance(&a));
    }

    #[test]
    fn test_display_round_trip() {
        for input in [
            "ssh://deploy@web-1:2222/var/www",
            "docker://app:/srv/data",
            "k8s://staging/web-1:/var/log",
        ] {
            let parsed = Endpoint::parse(input).unwrap();
            assert_eq!(Endpoint::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }
}

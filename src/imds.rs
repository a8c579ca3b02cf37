//! Instance metadata access for region resolution and account
//! identity.
//!
//! The metadata service is reachable on two link-local addresses. The
//! IPv6 one is preferred whenever the runtime can open an IPv6 socket
//! and the address answers a short TCP probe; otherwise fetches fall
//! back to the IPv4 literal. Every fetch is gated by a short-lived
//! token obtained per invocation; nothing is cached across calls.

use serde::Serialize;
use serde_json::Value;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, Level};

pub(crate) const CSP_NAME: &str = "amazon";

const IMDS_IPV4_HOST: &str = "169.254.169.254";
const IMDS_IPV6_ADDR: Ipv6Addr = Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254);
const IMDS_PORT: u16 = 80;

const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_TTL_SECONDS: u32 = 21600;
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const IDENTITY_PATH: &str = "/latest/dynamic/instance-identity";

const PROBE_ATTEMPTS: u32 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_BACKOFF: Duration = Duration::from_secs(1);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata access errors.
#[derive(Error, Debug)]
pub enum MetadataError {
    /// Token or document fetch failed at the transport level.
    #[error("instance metadata service unavailable: {0}")]
    Unavailable(String),

    /// The identity document was retrieved but carries no region.
    #[error("instance identity document has no region field")]
    RegionMissing,

    /// The identity document was retrieved but is not valid JSON.
    #[error("failed to parse instance identity document")]
    MalformedDocument(#[source] serde_json::Error),
}

/// Account identity assembled from the instance metadata service.
/// Fields whose fetch failed are absent rather than failing the whole
/// call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountInfo {
    pub identity_document: Option<Value>,
    pub signature: Option<String>,
    pub pkcs7: Option<String>,
    pub cloud_provider: &'static str,
}

/// Reachability checks used to pick the metadata address.
pub trait LinkProbe {
    fn ipv6_supported(&self) -> bool;

    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<()>;
}

struct NetProbe;

impl LinkProbe for NetProbe {
    fn ipv6_supported(&self) -> bool {
        UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).is_ok()
    }

    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<()> {
        TcpStream::connect_timeout(&addr, timeout).map(|_| ())
    }
}

/// Picks the metadata base URL. The IPv6 literal wins when the stack
/// supports it and the address answers within the probe budget; a hard
/// refusal abandons IPv6 immediately, a timeout is retried after a
/// one second pause.
pub fn select_base_url(probe: &dyn LinkProbe) -> String {
    if !probe.ipv6_supported() {
        return format!("http://{IMDS_IPV4_HOST}");
    }

    let candidate = SocketAddr::from((IMDS_IPV6_ADDR, IMDS_PORT));
    for attempt in 1..=PROBE_ATTEMPTS {
        match probe.connect(candidate, PROBE_TIMEOUT) {
            Ok(()) => return format!("http://[{IMDS_IPV6_ADDR}]"),
            Err(error) if error.kind() == io::ErrorKind::TimedOut => {
                if attempt < PROBE_ATTEMPTS {
                    thread::sleep(PROBE_BACKOFF);
                }
            }
            Err(_) => break,
        }
    }
    format!("http://{IMDS_IPV4_HOST}")
}

/// Raw HTTP access to the metadata service, kept behind a trait so the
/// resolver logic is testable with canned responses.
pub trait ImdsTransport {
    fn acquire_token(&mut self, base_url: &str) -> Result<String, MetadataError>;

    fn fetch(
        &mut self,
        base_url: &str,
        path: &str,
        token: Option<&str>,
    ) -> Result<String, MetadataError>;
}

pub struct HttpImdsTransport {
    http: reqwest::blocking::Client,
}

impl HttpImdsTransport {
    pub fn new() -> HttpImdsTransport {
        let http = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        HttpImdsTransport { http }
    }
}

impl ImdsTransport for HttpImdsTransport {
    fn acquire_token(&mut self, base_url: &str) -> Result<String, MetadataError> {
        self.http
            .put(format!("{base_url}{TOKEN_PATH}"))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text())
            .map_err(|error| MetadataError::Unavailable(error.to_string()))
    }

    fn fetch(
        &mut self,
        base_url: &str,
        path: &str,
        token: Option<&str>,
    ) -> Result<String, MetadataError> {
        let mut request = self.http.get(format!("{base_url}{path}"));
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }
        request
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text())
            .map_err(|error| MetadataError::Unavailable(error.to_string()))
    }
}

/// Resolves region and account identity from the metadata service.
///
/// Built fresh per hook invocation; the address probe runs once at
/// construction and the token is re-acquired on every operation.
pub struct MetadataResolver<'a> {
    transport: Box<dyn ImdsTransport + 'a>,
    base_url: String,
}

impl<'a> MetadataResolver<'a> {
    pub fn new() -> MetadataResolver<'a> {
        MetadataResolver {
            base_url: select_base_url(&NetProbe),
            transport: Box::new(HttpImdsTransport::new()),
        }
    }

    /// Leaves the responsibility to provide a transport to the client.
    /// Most of the times you should not need to use this.
    pub fn with_transport(
        transport: Box<dyn ImdsTransport + 'a>,
        base_url: String,
    ) -> MetadataResolver<'a> {
        MetadataResolver {
            transport,
            base_url,
        }
    }

    /// Reads the region from the instance identity document.
    ///
    /// A single attempt, no retry. Token acquisition failure is fatal
    /// here: billing for the wrong region is worse than failing loudly,
    /// so there is no unauthenticated fallback on this path.
    pub fn resolve_region(&mut self) -> Result<String, MetadataError> {
        let token = self.transport.acquire_token(&self.base_url)?;
        let text = self.transport.fetch(
            &self.base_url,
            &format!("{IDENTITY_PATH}/document"),
            Some(&token),
        )?;
        let document: Value =
            serde_json::from_str(&text).map_err(MetadataError::MalformedDocument)?;
        document
            .get("region")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(MetadataError::RegionMissing)
    }

    /// Assembles the account identity from three independent fetches.
    ///
    /// Unlike [`resolve_region`](Self::resolve_region), a failed token
    /// acquisition degrades to unauthenticated fetches, and each failed
    /// fetch leaves its field absent. The only fatal case is a document
    /// that is present but not valid JSON.
    pub fn fetch_account_info(&mut self) -> Result<AccountInfo, MetadataError> {
        let token = match self.transport.acquire_token(&self.base_url) {
            Ok(token) => Some(token),
            Err(error) => {
                event!(
                    Level::WARN,
                    "Fetching instance identity without a token. {}",
                    error
                );
                None
            }
        };
        let token = token.as_deref();

        let document = self.attachment("document", token);
        let signature = self.attachment("signature", token);
        let pkcs7 = self.attachment("pkcs7", token);

        let identity_document = match document {
            Some(text) => {
                Some(serde_json::from_str(&text).map_err(MetadataError::MalformedDocument)?)
            }
            None => None,
        };

        Ok(AccountInfo {
            identity_document,
            signature,
            pkcs7,
            cloud_provider: CSP_NAME,
        })
    }

    fn attachment(&mut self, name: &str, token: Option<&str>) -> Option<String> {
        match self
            .transport
            .fetch(&self.base_url, &format!("{IDENTITY_PATH}/{name}"), token)
        {
            Ok(text) => Some(text),
            Err(error) => {
                event!(
                    Level::WARN,
                    "Could not fetch instance identity {}. {}",
                    name,
                    error
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};
    use std::rc::Rc;

    struct FakeTransport {
        token: Option<String>,
        responses: HashMap<String, String>,
        calls: Rc<RefCell<Vec<(String, Option<String>)>>>,
    }

    impl FakeTransport {
        fn new(token: Option<&str>) -> FakeTransport {
            FakeTransport {
                token: token.map(str::to_string),
                responses: HashMap::new(),
                calls: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn respond(mut self, path: &str, body: &str) -> FakeTransport {
            self.responses.insert(path.to_string(), body.to_string());
            self
        }

        fn calls(&self) -> Rc<RefCell<Vec<(String, Option<String>)>>> {
            Rc::clone(&self.calls)
        }
    }

    impl ImdsTransport for FakeTransport {
        fn acquire_token(&mut self, _base_url: &str) -> Result<String, MetadataError> {
            self.token
                .clone()
                .ok_or_else(|| MetadataError::Unavailable("token route rejected".to_string()))
        }

        fn fetch(
            &mut self,
            _base_url: &str,
            path: &str,
            token: Option<&str>,
        ) -> Result<String, MetadataError> {
            self.calls
                .borrow_mut()
                .push((path.to_string(), token.map(str::to_string)));
            self.responses
                .get(path)
                .cloned()
                .ok_or_else(|| MetadataError::Unavailable(format!("no route for {path}")))
        }
    }

    fn resolver(transport: FakeTransport) -> MetadataResolver<'static> {
        MetadataResolver::with_transport(
            Box::new(transport),
            "http://169.254.169.254".to_string(),
        )
    }

    #[test]
    fn test_resolve_region() {
        let transport = FakeTransport::new(Some("imds-token")).respond(
            "/latest/dynamic/instance-identity/document",
            r#"{"region": "us-east-1"}"#,
        );
        let calls = transport.calls();
        let mut resolver = resolver(transport);

        let region = resolver.resolve_region().unwrap();

        assert_eq!(region, "us-east-1");
        assert_eq!(
            *calls.borrow(),
            vec![(
                "/latest/dynamic/instance-identity/document".to_string(),
                Some("imds-token".to_string()),
            )]
        );
    }

    #[test]
    fn test_resolve_region_missing_field() {
        let transport = FakeTransport::new(Some("imds-token")).respond(
            "/latest/dynamic/instance-identity/document",
            r#"{"accountId": "1234"}"#,
        );
        let mut resolver = resolver(transport);

        let result = resolver.resolve_region();
        assert!(matches!(result, Err(MetadataError::RegionMissing)));
    }

    #[test]
    fn test_resolve_region_token_failure_is_fatal() {
        let transport = FakeTransport::new(None).respond(
            "/latest/dynamic/instance-identity/document",
            r#"{"region": "us-east-1"}"#,
        );
        let mut resolver = resolver(transport);

        let result = resolver.resolve_region();
        assert!(matches!(result, Err(MetadataError::Unavailable(_))));
    }

    #[test]
    fn test_resolve_region_document_unreachable() {
        let mut resolver = resolver(FakeTransport::new(Some("imds-token")));

        let result = resolver.resolve_region();
        assert!(matches!(result, Err(MetadataError::Unavailable(_))));
    }

    #[test]
    fn test_resolve_region_document_not_json() {
        let transport = FakeTransport::new(Some("imds-token"))
            .respond("/latest/dynamic/instance-identity/document", "<html>");
        let mut resolver = resolver(transport);

        let result = resolver.resolve_region();
        assert!(matches!(result, Err(MetadataError::MalformedDocument(_))));
    }

    #[test]
    fn test_account_info_complete() {
        let transport = FakeTransport::new(Some("imds-token"))
            .respond(
                "/latest/dynamic/instance-identity/document",
                r#"{"region": "eu-central-1", "accountId": "1234"}"#,
            )
            .respond("/latest/dynamic/instance-identity/signature", "c2ln")
            .respond("/latest/dynamic/instance-identity/pkcs7", "cGtjczc=");
        let mut resolver = resolver(transport);

        let info = resolver.fetch_account_info().unwrap();

        assert_eq!(
            info.identity_document,
            Some(json!({"region": "eu-central-1", "accountId": "1234"}))
        );
        assert_eq!(info.signature, Some("c2ln".to_string()));
        assert_eq!(info.pkcs7, Some("cGtjczc=".to_string()));
        assert_eq!(info.cloud_provider, "amazon");
    }

    #[test]
    fn test_account_info_partial_fetch_failure() {
        let transport = FakeTransport::new(Some("imds-token"))
            .respond(
                "/latest/dynamic/instance-identity/document",
                r#"{"region": "eu-central-1"}"#,
            )
            .respond("/latest/dynamic/instance-identity/pkcs7", "cGtjczc=");
        let mut resolver = resolver(transport);

        let info = resolver.fetch_account_info().unwrap();

        assert!(info.identity_document.is_some());
        assert_eq!(info.signature, None);
        assert_eq!(info.pkcs7, Some("cGtjczc=".to_string()));
    }

    #[test]
    fn test_account_info_token_failure_degrades() {
        let transport = FakeTransport::new(None)
            .respond(
                "/latest/dynamic/instance-identity/document",
                r#"{"region": "eu-central-1"}"#,
            )
            .respond("/latest/dynamic/instance-identity/signature", "c2ln")
            .respond("/latest/dynamic/instance-identity/pkcs7", "cGtjczc=");
        let calls = transport.calls();
        let mut resolver = resolver(transport);

        let info = resolver.fetch_account_info().unwrap();

        assert!(info.identity_document.is_some());
        assert!(calls.borrow().iter().all(|(_, token)| token.is_none()));
    }

    #[test]
    fn test_account_info_never_fails_on_absent_fields() {
        let mut resolver = resolver(FakeTransport::new(Some("imds-token")));

        let info = resolver.fetch_account_info().unwrap();

        assert_eq!(info.identity_document, None);
        assert_eq!(info.signature, None);
        assert_eq!(info.pkcs7, None);
        assert_eq!(info.cloud_provider, "amazon");
    }

    #[test]
    fn test_account_info_unparseable_document_is_fatal() {
        let transport = FakeTransport::new(Some("imds-token"))
            .respond("/latest/dynamic/instance-identity/document", "not json");
        let mut resolver = resolver(transport);

        let result = resolver.fetch_account_info();
        assert!(matches!(result, Err(MetadataError::MalformedDocument(_))));
    }

    struct ScriptedProbe {
        supported: bool,
        results: RefCell<VecDeque<io::Result<()>>>,
        attempts: Cell<u32>,
    }

    impl ScriptedProbe {
        fn new(supported: bool, results: Vec<io::Result<()>>) -> ScriptedProbe {
            ScriptedProbe {
                supported,
                results: RefCell::new(results.into()),
                attempts: Cell::new(0),
            }
        }
    }

    impl LinkProbe for ScriptedProbe {
        fn ipv6_supported(&self) -> bool {
            self.supported
        }

        fn connect(&self, _addr: SocketAddr, _timeout: Duration) -> io::Result<()> {
            self.attempts.set(self.attempts.get() + 1);
            self.results
                .borrow_mut()
                .pop_front()
                .expect("no scripted probe result left")
        }
    }

    #[test]
    fn test_ipv6_used_when_reachable() {
        let probe = ScriptedProbe::new(true, vec![Ok(())]);
        assert_eq!(select_base_url(&probe), "http://[fd00:ec2::254]");
        assert_eq!(probe.attempts.get(), 1);
    }

    #[test]
    fn test_ipv4_used_without_ipv6_support() {
        let probe = ScriptedProbe::new(false, vec![]);
        assert_eq!(select_base_url(&probe), "http://169.254.169.254");
        assert_eq!(probe.attempts.get(), 0);
    }

    #[test]
    fn test_refused_probe_falls_back_immediately() {
        let probe = ScriptedProbe::new(
            true,
            vec![Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            ))],
        );
        assert_eq!(select_base_url(&probe), "http://169.254.169.254");
        assert_eq!(probe.attempts.get(), 1);
    }

    #[test]
    fn test_timed_out_probe_is_retried() {
        let timeout = || io::Error::new(io::ErrorKind::TimedOut, "timed out");
        let probe = ScriptedProbe::new(true, vec![Err(timeout()), Err(timeout()), Err(timeout())]);
        assert_eq!(select_base_url(&probe), "http://169.254.169.254");
        assert_eq!(probe.attempts.get(), 3);
    }

    #[test]
    fn test_probe_recovers_after_timeout() {
        let probe = ScriptedProbe::new(
            true,
            vec![
                Err(io::Error::new(io::ErrorKind::TimedOut, "timed out")),
                Ok(()),
            ],
        );
        assert_eq!(select_base_url(&probe), "http://[fd00:ec2::254]");
        assert_eq!(probe.attempts.get(), 2);
    }
}

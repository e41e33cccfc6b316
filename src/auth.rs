// Upstream proxy authentication: credentials and the NTLM handshake state machine
use crate::http::Headers;
use crate::ntlm::{self, AuthenticateInput, Challenge};
use base64::Engine;
use zeroize::Zeroizing;

const NTLM_SCHEME: &str = "NTLM";

/// Process-wide upstream credentials, immutable after startup.
#[derive(Clone)]
pub struct UpstreamCredentials {
    username: String,
    domain: String,
    password: Zeroizing<String>,
    workstation: String,
}

impl UpstreamCredentials {
    /// `DOMAIN\user` carries its own domain; `fallback_domain` is used otherwise.
    pub fn new(
        username: &str,
        password: &str,
        fallback_domain: Option<&str>,
        workstation: Option<&str>,
    ) -> Self {
        let (domain, user) = match username.split_once('\\') {
            Some((domain, user)) => (domain.to_string(), user.to_string()),
            None => (fallback_domain.unwrap_or_default().to_string(), username.to_string()),
        };
        UpstreamCredentials {
            username: user,
            domain,
            password: Zeroizing::new(password.to_string()),
            workstation: workstation.unwrap_or_default().to_string(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn workstation(&self) -> &str {
        &self.workstation
    }
}

impl std::fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    NegotiateSent,
    ChallengeReceived,
    AuthenticateSent,
    Authenticated,
    Failed,
}

/// Per-connection handshake bookkeeping. Token contents are never printed.
#[derive(Clone)]
pub struct HandshakeState {
    pub phase: Phase,
    pub scheme: Option<String>,
    negotiate: Option<Vec<u8>>,
    challenge: Option<Vec<u8>>,
    authenticate: Option<Vec<u8>>,
}

impl std::fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeState")
            .field("phase", &self.phase)
            .field("scheme", &self.scheme)
            .field("negotiate_len", &self.negotiate.as_ref().map(Vec::len))
            .field("challenge_len", &self.challenge.as_ref().map(Vec::len))
            .field("authenticate_len", &self.authenticate.as_ref().map(Vec::len))
            .finish()
    }
}

/// What the connector must do after a response was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Resend the request carrying this `Proxy-Authorization` value.
    Retry(String),
    Authenticated,
    Failed(String),
}

/// NTLM handshake over one upstream connection. Sans-IO: the caller sends
/// requests and feeds each response head back through [`Handshake::observe`].
pub struct Handshake<'a> {
    credentials: &'a UpstreamCredentials,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(credentials: &'a UpstreamCredentials) -> Self {
        Handshake {
            credentials,
            state: HandshakeState {
                phase: Phase::Init,
                scheme: None,
                negotiate: None,
                challenge: None,
                authenticate: None,
            },
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Advances the state machine with the status and headers of a response.
    pub fn observe(&mut self, status: u16, headers: &Headers) -> Step {
        let step = self.advance(status, headers);
        if let Step::Failed(ref reason) = step {
            tracing::debug!(phase = ?self.state.phase, "NTLM handshake failed: {}", reason);
            self.state.phase = Phase::Failed;
        }
        step
    }

    fn advance(&mut self, status: u16, headers: &Headers) -> Step {
        if status != 407 {
            return match self.state.phase {
                Phase::Failed => Step::Failed("handshake already failed".to_string()),
                _ => {
                    self.state.phase = Phase::Authenticated;
                    Step::Authenticated
                }
            };
        }

        match self.state.phase {
            Phase::Init => {
                if !offers_scheme(headers, NTLM_SCHEME) {
                    let offered = offered_schemes(headers);
                    return Step::Failed(if offered.is_empty() {
                        "407 without any Proxy-Authenticate challenge".to_string()
                    } else {
                        format!("unsupported proxy authentication scheme(s): {}", offered.join(", "))
                    });
                }
                self.state.scheme = Some(NTLM_SCHEME.to_string());

                let domain = Some(self.credentials.domain());
                let workstation = Some(self.credentials.workstation());
                let token = ntlm::negotiate_message(domain, workstation);
                let header = authorization_value(&token);
                self.state.negotiate = Some(token);
                self.state.phase = Phase::NegotiateSent;
                Step::Retry(header)
            }
            Phase::NegotiateSent => {
                let Some(raw) = extract_proxy_auth_challenge(headers, NTLM_SCHEME) else {
                    return Step::Failed("407 without an NTLM challenge token".to_string());
                };
                let challenge = match Challenge::parse(&raw) {
                    Ok(c) => c,
                    Err(e) => return Step::Failed(e.to_string()),
                };
                self.state.challenge = Some(raw);
                self.state.phase = Phase::ChallengeReceived;

                let input = AuthenticateInput {
                    username: self.credentials.username(),
                    password: &self.credentials.password,
                    domain: self.credentials.domain(),
                    workstation: self.credentials.workstation(),
                };
                match ntlm::authenticate_message(&challenge, &input) {
                    Ok(token) => {
                        let header = authorization_value(&token);
                        self.state.authenticate = Some(token);
                        self.state.phase = Phase::AuthenticateSent;
                        Step::Retry(header)
                    }
                    Err(e) => Step::Failed(e.to_string()),
                }
            }
            Phase::AuthenticateSent => {
                Step::Failed("upstream rejected the NTLM credentials".to_string())
            }
            Phase::ChallengeReceived | Phase::Authenticated | Phase::Failed => {
                Step::Failed("unexpected 407 for the current handshake phase".to_string())
            }
        }
    }
}

fn authorization_value(token: &[u8]) -> String {
    format!(
        "{} {}",
        NTLM_SCHEME,
        base64::engine::general_purpose::STANDARD.encode(token)
    )
}

/// Scheme names offered across all `Proxy-Authenticate` lines.
pub fn offered_schemes(headers: &Headers) -> Vec<String> {
    headers
        .get_all("Proxy-Authenticate")
        .flat_map(|v| v.split(','))
        .filter_map(|part| part.split_whitespace().next())
        // auth-params such as `realm="x"` are not scheme names
        .filter(|name| !name.contains('='))
        .map(str::to_string)
        .collect()
}

fn offers_scheme(headers: &Headers, scheme: &str) -> bool {
    offered_schemes(headers)
        .iter()
        .any(|s| s.eq_ignore_ascii_case(scheme))
}

/// Decoded token following `scheme` in a `Proxy-Authenticate` header.
/// `None` when the scheme is absent, bare, or its token is not base64.
pub fn extract_proxy_auth_challenge(headers: &Headers, scheme: &str) -> Option<Vec<u8>> {
    let scheme_lower = scheme.to_ascii_lowercase();

    for value in headers.get_all("Proxy-Authenticate") {
        for part in value.split(',') {
            let trimmed = part.trim();
            let lower = trimmed.to_ascii_lowercase();

            if lower.starts_with(&(scheme_lower.clone() + " ")) {
                let token = trimmed[scheme.len()..].trim();
                if token.is_empty() {
                    continue;
                }

                if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(token) {
                    return Some(decoded);
                }
            }
        }
    }

    None
}

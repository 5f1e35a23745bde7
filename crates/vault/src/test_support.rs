//! In-process fake CA for workflow tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use acmevault_common::PollPolicy;
use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair, SerialNumber};
use tempfile::TempDir;
use uuid::Uuid;

use crate::challenge::ChallengeType;
use crate::error::Problem;
use crate::manager::VaultManager;
use crate::store::{OpenMode, VaultStore};
use crate::transport::{
    AccountContext, AcmeTransport, AuthorizationChallenge, AuthorizationState, AuthorizationStatus,
    CertificateRequest, Link, RegistrationObject, ServerDirectory, TransportError, LINK_REL_UP,
};

pub const CA_BASE_URI: &str = "https://ca.test/acme/";
const TERMS_URI: &str = "https://ca.test/terms";
const ISSUER_LINK: &str = "https://ca.test/acme/issuer";

/// What happens to an authorization once its challenge is answered
#[derive(Debug, Clone)]
pub enum AuthorizationBehavior {
    Valid,
    Invalid(Problem),
    StayPending,
}

#[derive(Debug)]
struct FakeCaState {
    registration_failure: Option<Problem>,
    authorization_failure: Option<Problem>,
    issuance_failure: Option<Problem>,
    preauthorized: bool,
    behavior: AuthorizationBehavior,
    /// Refreshes before content appears; `None` never issues
    issue_after: Option<u32>,
    /// Issuer downloads left to fail
    issuer_failures: u32,

    authorizations: HashMap<String, (AuthorizationState, bool)>,
    requests: HashMap<String, u32>,
    registrations: u32,

    directory_calls: u32,
    authorization_refreshes: u32,
    certificate_refreshes: u32,
    issuer_fetches: u32,
    answered: u32,
    revocations: u32,
}

/// Scriptable [`AcmeTransport`] that issues self-signed certificates
#[derive(Debug, Clone)]
pub struct FakeCa {
    state: Arc<Mutex<FakeCaState>>,
    issuer_der: Arc<Vec<u8>>,
}

impl FakeCa {
    pub const ISSUER_SERIAL: &'static str = "0A1B2C";

    pub fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["Fake Issuer".to_string()]).unwrap();
        params.serial_number = Some(SerialNumber::from(vec![0x0A, 0x1B, 0x2C]));
        let issuer = params.self_signed(&key).unwrap();

        Self {
            state: Arc::new(Mutex::new(FakeCaState {
                registration_failure: None,
                authorization_failure: None,
                issuance_failure: None,
                preauthorized: false,
                behavior: AuthorizationBehavior::Valid,
                issue_after: Some(0),
                issuer_failures: 0,
                authorizations: HashMap::new(),
                requests: HashMap::new(),
                registrations: 0,
                directory_calls: 0,
                authorization_refreshes: 0,
                certificate_refreshes: 0,
                issuer_fetches: 0,
                answered: 0,
                revocations: 0,
            })),
            issuer_der: Arc::new(issuer.der().to_vec()),
        }
    }

    pub fn fail_registration(&self, problem_type: &str, detail: &str) {
        self.state.lock().registration_failure = Some(Problem::new(problem_type, detail));
    }

    pub fn fail_authorization(&self, problem_type: &str, detail: &str) {
        self.state.lock().authorization_failure = Some(Problem::new(problem_type, detail));
    }

    pub fn fail_issuance(&self, problem_type: &str, detail: &str) {
        self.state.lock().issuance_failure = Some(Problem::new(problem_type, detail));
    }

    pub fn set_preauthorized(&self, preauthorized: bool) {
        self.state.lock().preauthorized = preauthorized;
    }

    pub fn set_authorization_behavior(&self, behavior: AuthorizationBehavior) {
        self.state.lock().behavior = behavior;
    }

    pub fn set_issue_after(&self, refreshes: Option<u32>) {
        self.state.lock().issue_after = refreshes;
    }

    pub fn fail_issuer_fetches(&self, count: u32) {
        self.state.lock().issuer_failures = count;
    }

    pub fn directory_calls(&self) -> u32 {
        self.state.lock().directory_calls
    }

    pub fn authorization_refreshes(&self) -> u32 {
        self.state.lock().authorization_refreshes
    }

    pub fn certificate_refreshes(&self) -> u32 {
        self.state.lock().certificate_refreshes
    }

    pub fn issuer_fetches(&self) -> u32 {
        self.state.lock().issuer_fetches
    }

    pub fn answered_challenges(&self) -> u32 {
        self.state.lock().answered
    }

    pub fn revocations(&self) -> u32 {
        self.state.lock().revocations
    }

    fn leaf_certificate() -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["www.example.com".to_string()]).unwrap();
        params.serial_number = Some(SerialNumber::from(Uuid::new_v4().as_bytes()[..8].to_vec()));
        params.self_signed(&key).unwrap().der().to_vec()
    }

    fn certificate_request(uri: String, issued: bool) -> CertificateRequest {
        CertificateRequest {
            uri,
            content: issued.then(Self::leaf_certificate),
            links: vec![Link {
                rel: LINK_REL_UP.to_string(),
                uri: ISSUER_LINK.to_string(),
            }],
            retry_after: None,
        }
    }
}

#[async_trait]
impl AcmeTransport for FakeCa {
    async fn directory(&self, base_uri: &str) -> Result<ServerDirectory, TransportError> {
        self.state.lock().directory_calls += 1;
        Ok(ServerDirectory {
            new_registration: format!("{base_uri}new-reg"),
            new_authorization: format!("{base_uri}new-authz"),
            new_certificate: format!("{base_uri}new-cert"),
            revoke_certificate: format!("{base_uri}revoke-cert"),
            terms_of_service: Some(TERMS_URI.to_string()),
        })
    }

    async fn new_registration(
        &self,
        _account: AccountContext<'_>,
        contacts: &[String],
    ) -> Result<RegistrationObject, TransportError> {
        let mut state = self.state.lock();
        if let Some(problem) = state.registration_failure.clone() {
            return Err(TransportError::Problem(problem));
        }
        state.registrations += 1;
        Ok(RegistrationObject {
            uri: format!("{CA_BASE_URI}reg/{}", state.registrations),
            contacts: contacts.to_vec(),
            agreement: None,
            terms_of_service: Some(TERMS_URI.to_string()),
        })
    }

    async fn agree_to_terms(
        &self,
        account: AccountContext<'_>,
        terms_uri: &str,
    ) -> Result<RegistrationObject, TransportError> {
        let mut registration = account
            .registration
            .cloned()
            .ok_or_else(|| TransportError::Network("no registration in context".to_string()))?;
        registration.agreement = Some(terms_uri.to_string());
        Ok(registration)
    }

    async fn new_authorization(
        &self,
        _account: AccountContext<'_>,
        dns: &str,
    ) -> Result<AuthorizationState, TransportError> {
        let mut state = self.state.lock();
        if let Some(problem) = state.authorization_failure.clone() {
            return Err(TransportError::Problem(problem));
        }

        let id = Uuid::new_v4().simple().to_string();
        let status = if state.preauthorized {
            AuthorizationStatus::Valid
        } else {
            AuthorizationStatus::Pending
        };
        let challenges = ChallengeType::ALL
            .into_iter()
            .map(|challenge_type| AuthorizationChallenge {
                challenge_type,
                uri: format!("{CA_BASE_URI}chall/{id}/{challenge_type}"),
                token: format!("{}-{}", challenge_type.as_str().replace('-', ""), &id[..12]),
                status,
                error: None,
                iterations: (challenge_type == ChallengeType::TlsSni01).then_some(1),
            })
            .collect();

        let authorization = AuthorizationState {
            identifier: dns.to_string(),
            uri: format!("{CA_BASE_URI}authz/{id}"),
            status,
            expires: Some(chrono::Utc::now() + chrono::Duration::days(7)),
            challenges,
        };
        state
            .authorizations
            .insert(authorization.uri.clone(), (authorization.clone(), false));
        Ok(authorization)
    }

    async fn refresh_authorization(
        &self,
        _account: AccountContext<'_>,
        authorization_uri: &str,
    ) -> Result<AuthorizationState, TransportError> {
        let mut state = self.state.lock();
        state.authorization_refreshes += 1;
        let behavior = state.behavior.clone();

        let (authorization, answered) = state
            .authorizations
            .get_mut(authorization_uri)
            .ok_or_else(|| {
                let problem = Problem::new("urn:acme:error:malformed", "No such authorization");
                TransportError::Problem(problem)
            })?;

        if *answered && authorization.is_pending() {
            match behavior {
                AuthorizationBehavior::Valid => {
                    authorization.status = AuthorizationStatus::Valid;
                    for challenge in &mut authorization.challenges {
                        challenge.status = AuthorizationStatus::Valid;
                    }
                }
                AuthorizationBehavior::Invalid(problem) => {
                    authorization.status = AuthorizationStatus::Invalid;
                    if let Some(challenge) = authorization.challenges.first_mut() {
                        challenge.status = AuthorizationStatus::Invalid;
                        challenge.error = Some(problem);
                    }
                }
                AuthorizationBehavior::StayPending => {}
            }
        }

        Ok(authorization.clone())
    }

    async fn answer_challenge(
        &self,
        _account: AccountContext<'_>,
        challenge_uri: &str,
        key_authorization: &str,
    ) -> Result<AuthorizationChallenge, TransportError> {
        let mut state = self.state.lock();
        state.answered += 1;

        let (authorization, answered) = state
            .authorizations
            .values_mut()
            .find(|(a, _)| a.challenges.iter().any(|c| c.uri == challenge_uri))
            .ok_or_else(|| {
                let problem = Problem::new("urn:acme:error:malformed", "No such challenge");
                TransportError::Problem(problem)
            })?;
        *answered = true;

        let challenge = authorization
            .challenges
            .iter()
            .find(|c| c.uri == challenge_uri)
            .cloned()
            .ok_or_else(|| TransportError::Network("challenge vanished".to_string()))?;
        if !key_authorization.starts_with(&format!("{}.", challenge.token)) {
            return Err(TransportError::Problem(Problem::new(
                "urn:acme:error:unauthorized",
                "Key authorization does not match token",
            )));
        }
        Ok(challenge)
    }

    async fn request_certificate(
        &self,
        _account: AccountContext<'_>,
        _csr_der_b64url: &str,
    ) -> Result<CertificateRequest, TransportError> {
        let mut state = self.state.lock();
        if let Some(problem) = state.issuance_failure.clone() {
            return Err(TransportError::Problem(problem));
        }

        let uri = format!("{CA_BASE_URI}cert/{}", Uuid::new_v4().simple());
        state.requests.insert(uri.clone(), 0);
        let issued = state.issue_after == Some(0);
        Ok(Self::certificate_request(uri, issued))
    }

    async fn refresh_certificate(
        &self,
        _account: AccountContext<'_>,
        request: &CertificateRequest,
    ) -> Result<CertificateRequest, TransportError> {
        let mut state = self.state.lock();
        state.certificate_refreshes += 1;
        let issue_after = state.issue_after;

        let refreshes = state
            .requests
            .get_mut(&request.uri)
            .ok_or_else(|| TransportError::Network(format!("unknown request {}", request.uri)))?;
        *refreshes += 1;
        let issued = issue_after.is_some_and(|n| *refreshes >= n);
        Ok(Self::certificate_request(request.uri.clone(), issued))
    }

    async fn fetch_issuer(&self, link: &str) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        state.issuer_fetches += 1;
        if state.issuer_failures > 0 {
            state.issuer_failures -= 1;
            return Err(TransportError::Network("issuer download reset".to_string()));
        }
        drop(state);
        if link != ISSUER_LINK {
            return Err(TransportError::Network(format!("unknown link {link}")));
        }
        Ok(self.issuer_der.as_ref().clone())
    }

    async fn revoke_certificate(
        &self,
        _account: AccountContext<'_>,
        _certificate_der_b64url: &str,
    ) -> Result<(), TransportError> {
        self.state.lock().revocations += 1;
        Ok(())
    }
}

/// Short poll intervals so unpaused tests stay fast
pub fn fast_policy(max_attempts: u32) -> PollPolicy {
    PollPolicy::new(max_attempts, Duration::from_millis(10))
}

/// Fresh vault wired to the fake CA
pub fn setup_manager(ca: &FakeCa) -> (TempDir, VaultManager) {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("vault");
    let store = VaultStore::open(root, OpenMode::InitIfMissing, fast_policy(3)).unwrap();
    store.init_vault(CA_BASE_URI).unwrap();

    let manager = VaultManager::new(store, Arc::new(ca.clone()))
        .with_authorization_policy(fast_policy(3))
        .with_issuance_policy(fast_policy(5));
    (temp_dir, manager)
}

/// Vault with a current registration
pub async fn registered_manager(ca: &FakeCa) -> (TempDir, VaultManager) {
    let (temp_dir, manager) = setup_manager(ca);
    manager
        .new_registration(&["mailto:admin@example.com".to_string()], true)
        .await
        .unwrap();
    (temp_dir, manager)
}

/// Vault with a valid identifier for `domain`, returning its alias
pub async fn authorized_manager(ca: &FakeCa, domain: &str) -> (TempDir, VaultManager, String) {
    let (temp_dir, manager) = registered_manager(ca).await;
    let start = manager
        .begin_authorization(domain, ChallengeType::Http01)
        .await
        .unwrap();
    let alias = start.identifier.alias.clone();
    manager
        .submit_challenge(&alias, ChallengeType::Http01, false)
        .await
        .unwrap();
    manager.complete_authorization(&alias).await.unwrap();
    (temp_dir, manager, alias)
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! SAML 2.0 service provider support.
//!
//! - [`SamlVerifier`] validates an IdP response: signature (through an
//!   [`XmlSignatureVerifier`]), status, issuer, validity window, audience,
//!   and yields the `NameID` as a verified email.
//! - [`SamlService`] is the HTTP-facing side: IdP metadata fetch and cache,
//!   SP-initiated redirects and the SP metadata document.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use flate2::{write::DeflateEncoder, Compression};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{json, Map};
use tokio::sync::RwLock;

use crate::models::{IdentityAssertion, ProviderEmail};
use crate::time_utils::format_utc_rfc3339;

/// Upper bound on an encoded `SAMLResponse`.
const MAX_RESPONSE_SIZE: usize = 512 * 1024;
const CLOCK_SKEW_SECS: i64 = 60;
const METADATA_CACHE_TTL: Duration = Duration::from_secs(600);

const BINDING_HTTP_POST: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
const BINDING_HTTP_REDIRECT: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
const NAMEID_FORMAT_EMAIL: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

#[derive(Debug, thiserror::Error)]
pub enum SamlError {
    #[error("SAML response is malformed: {0}")]
    Malformed(String),

    #[error("SAML response signature is invalid: {0}")]
    SignatureInvalid(String),

    #[error("SAML assertion is outside its validity window")]
    InvalidTime,

    #[error("SAML assertion is not addressed to this service provider")]
    NotInAudience,

    #[error("SAML assertion issued by unexpected IdP {0}")]
    IssuerMismatch(String),

    #[error("SAML response status is {0}")]
    Status(String),

    #[error("Failed to load IdP metadata: {0}")]
    Metadata(String),
}

/// XML-DSig verification. [`X509SignatureVerifier`](super::X509SignatureVerifier)
/// is the production implementation.
pub trait XmlSignatureVerifier: Send + Sync {
    /// Verify the enveloped signature of `xml` against the IdP's
    /// base64-encoded DER certificates.
    fn verify(&self, xml: &str, certificates: &[String]) -> Result<(), String>;
}

/// Parsed IdP metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdpMetadata {
    pub entity_id: String,
    /// HTTP-Redirect single sign-on endpoint
    pub sso_url: Option<String>,
    /// Base64 DER signing certificates
    pub certificates: Vec<String>,
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, SamlError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| SamlError::Malformed(e.to_string()))?;
        if attr.key.local_name().as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| SamlError::Malformed(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

impl IdpMetadata {
    /// Parse an `EntityDescriptor` document.
    pub fn parse(xml: &str) -> Result<Self, SamlError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut metadata = IdpMetadata::default();
        let mut stack: Vec<String> = Vec::new();
        let mut in_signing_key = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = local_name(&e);
                    match name.as_str() {
                        "EntityDescriptor" if metadata.entity_id.is_empty() => {
                            metadata.entity_id = attribute(&e, "entityID")?.unwrap_or_default();
                        }
                        "KeyDescriptor" => {
                            in_signing_key = stack.iter().any(|n| n == "IDPSSODescriptor")
                                && attribute(&e, "use")?.map_or(true, |u| u == "signing");
                        }
                        _ => {}
                    }
                    stack.push(name);
                }
                Ok(Event::Empty(e)) => {
                    if local_name(&e) == "SingleSignOnService"
                        && stack.iter().any(|n| n == "IDPSSODescriptor")
                        && attribute(&e, "Binding")?.as_deref() == Some(BINDING_HTTP_REDIRECT)
                    {
                        metadata.sso_url = attribute(&e, "Location")?;
                    }
                }
                Ok(Event::Text(t)) => {
                    if in_signing_key && stack.last().map(String::as_str) == Some("X509Certificate")
                    {
                        let text = t
                            .unescape()
                            .map_err(|e| SamlError::Metadata(e.to_string()))?;
                        let cert: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                        if !cert.is_empty() {
                            metadata.certificates.push(cert);
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    if stack.pop().as_deref() == Some("KeyDescriptor") {
                        in_signing_key = false;
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(SamlError::Metadata(e.to_string())),
                _ => {}
            }
        }

        if metadata.entity_id.is_empty() {
            return Err(SamlError::Metadata("missing entityID".to_string()));
        }
        if metadata.certificates.is_empty() {
            return Err(SamlError::Metadata(
                "no IdP signing certificate found".to_string(),
            ));
        }
        Ok(metadata)
    }
}

/// Fields extracted from a SAML `Response`.
#[derive(Debug, Default)]
struct ParsedResponse {
    status: Option<String>,
    assertions: usize,
    issuer: Option<String>,
    name_id: Option<String>,
    not_before: Option<String>,
    not_on_or_after: Option<String>,
    has_conditions: bool,
    audiences: Vec<String>,
}

impl ParsedResponse {
    fn parse(xml: &str) -> Result<Self, SamlError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut parsed = ParsedResponse::default();
        let mut stack: Vec<String> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = local_name(&e);
                    parsed.element(&name, &e, &stack)?;
                    stack.push(name);
                }
                Ok(Event::Empty(e)) => {
                    let name = local_name(&e);
                    parsed.element(&name, &e, &stack)?;
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| SamlError::Malformed(e.to_string()))?
                        .trim()
                        .to_string();
                    parsed.text(&stack, text);
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(SamlError::Malformed(e.to_string())),
                _ => {}
            }
        }
        Ok(parsed)
    }

    fn element(
        &mut self,
        name: &str,
        e: &BytesStart<'_>,
        stack: &[String],
    ) -> Result<(), SamlError> {
        let parent = stack.last().map(String::as_str);
        match name {
            "EncryptedAssertion" => {
                return Err(SamlError::Malformed(
                    "encrypted assertions are not supported".to_string(),
                ))
            }
            "Assertion" => self.assertions += 1,
            // Only the top-level status counts, not nested ones.
            "StatusCode" if parent == Some("Status") && stack.len() == 2 => {
                self.status = attribute(e, "Value")?;
            }
            "Conditions" if parent == Some("Assertion") => {
                self.has_conditions = true;
                self.not_before = attribute(e, "NotBefore")?;
                self.not_on_or_after = attribute(e, "NotOnOrAfter")?;
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, stack: &[String], text: String) {
        let n = stack.len();
        let current = stack.last().map(String::as_str);
        let parent = n.checked_sub(2).map(|i| stack[i].as_str());
        match (parent, current) {
            (Some("Assertion"), Some("Issuer")) => self.issuer = Some(text),
            (Some("Response"), Some("Issuer")) if self.issuer.is_none() => {
                self.issuer = Some(text)
            }
            (Some("Subject"), Some("NameID")) => self.name_id = Some(text),
            (Some("AudienceRestriction"), Some("Audience")) => self.audiences.push(text),
            _ => {}
        }
    }
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, SamlError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SamlError::Malformed(format!("bad timestamp '{}': {}", value, e)))
}

/// Validates IdP responses for one service provider.
#[derive(Clone)]
pub struct SamlVerifier {
    sp_entity_id: String,
    signature: Arc<dyn XmlSignatureVerifier>,
}

impl SamlVerifier {
    pub fn new(sp_entity_id: impl Into<String>, signature: Arc<dyn XmlSignatureVerifier>) -> Self {
        Self {
            sp_entity_id: sp_entity_id.into(),
            signature,
        }
    }

    /// Verify a base64 `SAMLResponse` and extract the identity.
    pub fn verify(
        &self,
        raw_response: &str,
        metadata: &IdpMetadata,
        now: DateTime<Utc>,
    ) -> Result<IdentityAssertion, SamlError> {
        if raw_response.len() > MAX_RESPONSE_SIZE {
            return Err(SamlError::Malformed(format!(
                "SAMLResponse exceeds {} bytes",
                MAX_RESPONSE_SIZE
            )));
        }
        let compact: String = raw_response.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| SamlError::Malformed(format!("base64 decode failed: {}", e)))?;
        let xml = String::from_utf8(decoded)
            .map_err(|_| SamlError::Malformed("response is not UTF-8".to_string()))?;

        self.signature
            .verify(&xml, &metadata.certificates)
            .map_err(SamlError::SignatureInvalid)?;

        let parsed = ParsedResponse::parse(&xml)?;

        match parsed.status.as_deref() {
            Some(STATUS_SUCCESS) => {}
            Some(other) => return Err(SamlError::Status(other.to_string())),
            None => return Err(SamlError::Malformed("missing StatusCode".to_string())),
        }
        if parsed.assertions != 1 {
            return Err(SamlError::Malformed(format!(
                "expected exactly one assertion, found {}",
                parsed.assertions
            )));
        }
        let issuer = parsed
            .issuer
            .as_deref()
            .ok_or_else(|| SamlError::Malformed("missing Issuer".to_string()))?;
        if issuer != metadata.entity_id {
            return Err(SamlError::IssuerMismatch(issuer.to_string()));
        }

        if !parsed.has_conditions {
            return Err(SamlError::Malformed("assertion has no Conditions".to_string()));
        }
        let skew = chrono::Duration::seconds(CLOCK_SKEW_SECS);
        if let Some(not_before) = parsed.not_before.as_deref() {
            if now + skew < parse_instant(not_before)? {
                return Err(SamlError::InvalidTime);
            }
        }
        if let Some(not_on_or_after) = parsed.not_on_or_after.as_deref() {
            if now - skew >= parse_instant(not_on_or_after)? {
                return Err(SamlError::InvalidTime);
            }
        }

        if !parsed.audiences.iter().any(|a| a == &self.sp_entity_id) {
            return Err(SamlError::NotInAudience);
        }

        let name_id = parsed
            .name_id
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SamlError::Malformed("missing NameID".to_string()))?;

        let mut metadata_map = Map::new();
        metadata_map.insert("sub".into(), json!(name_id));
        metadata_map.insert("provider_id".into(), json!(name_id));
        metadata_map.insert("iss".into(), json!(metadata.entity_id));
        metadata_map.insert("email".into(), json!(name_id));
        metadata_map.insert("email_verified".into(), json!(true));

        Ok(IdentityAssertion {
            emails: vec![ProviderEmail::new(name_id, true, true)],
            metadata: metadata_map,
        })
    }
}

enum MetadataSource {
    Url(String),
    Static(Arc<IdpMetadata>),
}

/// SAML endpoints for one instance.
pub struct SamlService {
    api_base: String,
    verifier: SamlVerifier,
    source: MetadataSource,
    http: reqwest::Client,
    cache: RwLock<Option<(Arc<IdpMetadata>, Instant)>>,
}

impl SamlService {
    /// IdP metadata is fetched from `metadata_url` and cached.
    pub fn new(
        api_base: &str,
        metadata_url: &str,
        signature: Arc<dyn XmlSignatureVerifier>,
        http: reqwest::Client,
    ) -> Self {
        Self::build(
            api_base,
            MetadataSource::Url(metadata_url.to_string()),
            signature,
            http,
        )
    }

    /// Use fixed IdP metadata (tests and static deployments).
    pub fn with_metadata(
        api_base: &str,
        metadata: IdpMetadata,
        signature: Arc<dyn XmlSignatureVerifier>,
    ) -> Self {
        Self::build(
            api_base,
            MetadataSource::Static(Arc::new(metadata)),
            signature,
            reqwest::Client::new(),
        )
    }

    fn build(
        api_base: &str,
        source: MetadataSource,
        signature: Arc<dyn XmlSignatureVerifier>,
        http: reqwest::Client,
    ) -> Self {
        let api_base = api_base.trim_end_matches('/').to_string();
        let verifier = SamlVerifier::new(format!("{}/saml", api_base), signature);
        Self {
            api_base,
            verifier,
            source,
            http,
            cache: RwLock::new(None),
        }
    }

    pub fn entity_id(&self) -> String {
        format!("{}/saml", self.api_base)
    }

    pub fn acs_url(&self) -> String {
        format!("{}/saml/acs", self.api_base)
    }

    /// IdP metadata, refreshed after the cache TTL.
    pub async fn idp_metadata(&self) -> Result<Arc<IdpMetadata>, SamlError> {
        let url = match &self.source {
            MetadataSource::Static(metadata) => return Ok(metadata.clone()),
            MetadataSource::Url(url) => url,
        };

        {
            let cache = self.cache.read().await;
            if let Some((metadata, fetched_at)) = cache.as_ref() {
                if fetched_at.elapsed() < METADATA_CACHE_TTL {
                    return Ok(metadata.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        if let Some((metadata, fetched_at)) = cache.as_ref() {
            if fetched_at.elapsed() < METADATA_CACHE_TTL {
                return Ok(metadata.clone());
            }
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SamlError::Metadata(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SamlError::Metadata(format!(
                "metadata endpoint returned {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SamlError::Metadata(e.to_string()))?;
        let metadata = Arc::new(IdpMetadata::parse(&body)?);

        tracing::info!(idp = %metadata.entity_id, "Loaded SAML IdP metadata");
        *cache = Some((metadata.clone(), Instant::now()));
        Ok(metadata)
    }

    /// Verify a posted `SAMLResponse`.
    pub async fn verify_response(
        &self,
        raw_response: &str,
    ) -> Result<IdentityAssertion, SamlError> {
        let metadata = self.idp_metadata().await?;
        self.verifier.verify(raw_response, &metadata, Utc::now())
    }

    /// SP-initiated redirect (HTTP-Redirect binding) with `state` as RelayState.
    pub async fn authorize_url(&self, state: &str) -> Result<String, SamlError> {
        let metadata = self.idp_metadata().await?;
        let sso_url = metadata
            .sso_url
            .as_deref()
            .ok_or_else(|| SamlError::Metadata("IdP has no HTTP-Redirect SSO endpoint".into()))?;

        let request = self.authn_request(sso_url, Utc::now());
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(request.as_bytes())
            .map_err(|e| SamlError::Malformed(e.to_string()))?;
        let deflated = encoder
            .finish()
            .map_err(|e| SamlError::Malformed(e.to_string()))?;

        let separator = if sso_url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}SAMLRequest={}&RelayState={}",
            sso_url,
            separator,
            urlencoding::encode(&STANDARD.encode(deflated)),
            urlencoding::encode(state)
        ))
    }

    fn authn_request(&self, destination: &str, now: DateTime<Utc>) -> String {
        format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" "#,
                r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" "#,
                r#"ID="_{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" "#,
                r#"AssertionConsumerServiceURL="{acs}" ProtocolBinding="{binding}">"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<samlp:NameIDPolicy Format="{format}" AllowCreate="true"/>"#,
                r#"</samlp:AuthnRequest>"#
            ),
            id = uuid::Uuid::new_v4().simple(),
            instant = format_utc_rfc3339(now),
            destination = quick_xml::escape::escape(destination),
            acs = quick_xml::escape::escape(&self.acs_url()),
            binding = BINDING_HTTP_POST,
            issuer = quick_xml::escape::escape(&self.entity_id()),
            format = NAMEID_FORMAT_EMAIL,
        )
    }

    /// SP metadata document served at `/saml/metadata`.
    pub fn sp_metadata_xml(&self) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                "\n",
                r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity}">"#,
                r#"<md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" "#,
                r#"protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
                r#"<md:NameIDFormat>{format}</md:NameIDFormat>"#,
                r#"<md:AssertionConsumerService Binding="{binding}" Location="{acs}" index="1"/>"#,
                r#"</md:SPSSODescriptor>"#,
                r#"</md:EntityDescriptor>"#
            ),
            entity = quick_xml::escape::escape(&self.entity_id()),
            format = NAMEID_FORMAT_EMAIL,
            binding = BINDING_HTTP_POST,
            acs = quick_xml::escape::escape(&self.acs_url()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll;

    impl XmlSignatureVerifier for AcceptAll {
        fn verify(&self, _xml: &str, _certificates: &[String]) -> Result<(), String> {
            Ok(())
        }
    }

    const METADATA: &str = r#"<?xml version="1.0"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://idp.example.com">
  <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:KeyDescriptor use="encryption">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>ENCCERT</ds:X509Certificate></ds:X509Data></ds:KeyInfo>
    </md:KeyDescriptor>
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>
        MIIBsigning
        cert==
      </ds:X509Certificate></ds:X509Data></ds:KeyInfo>
    </md:KeyDescriptor>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.com/sso/post"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/sso"/>
  </md:IDPSSODescriptor>
</md:EntityDescriptor>"#;

    #[test]
    fn test_parse_idp_metadata() {
        let metadata = IdpMetadata::parse(METADATA).unwrap();
        assert_eq!(metadata.entity_id, "https://idp.example.com");
        assert_eq!(metadata.sso_url.as_deref(), Some("https://idp.example.com/sso"));
        assert_eq!(metadata.certificates, vec!["MIIBsigningcert==".to_string()]);
    }

    #[test]
    fn test_metadata_without_certificate_rejected() {
        let xml = r#"<EntityDescriptor entityID="x"><IDPSSODescriptor/></EntityDescriptor>"#;
        assert!(matches!(
            IdpMetadata::parse(xml),
            Err(SamlError::Metadata(_))
        ));
    }

    #[test]
    fn test_sp_metadata_document() {
        let service = SamlService::with_metadata(
            "https://api.example.com/",
            IdpMetadata::parse(METADATA).unwrap(),
            Arc::new(AcceptAll),
        );
        let xml = service.sp_metadata_xml();
        assert!(xml.contains(r#"entityID="https://api.example.com/saml""#));
        assert!(xml.contains(r#"Location="https://api.example.com/saml/acs""#));
    }

    #[tokio::test]
    async fn test_authorize_url_carries_relay_state() {
        let service = SamlService::with_metadata(
            "https://api.example.com",
            IdpMetadata::parse(METADATA).unwrap(),
            Arc::new(AcceptAll),
        );
        let url = service.authorize_url("state.token").await.unwrap();
        assert!(url.starts_with("https://idp.example.com/sso?SAMLRequest="));
        assert!(url.ends_with("&RelayState=state.token"));
    }

    #[test]
    fn test_oversized_response_rejected() {
        let verifier = SamlVerifier::new("sp", Arc::new(AcceptAll));
        let huge = "A".repeat(MAX_RESPONSE_SIZE + 1);
        assert!(matches!(
            verifier.verify(&huge, &IdpMetadata::default(), Utc::now()),
            Err(SamlError::Malformed(_))
        ));
    }

    #[test]
    fn test_response_without_issuer_is_malformed() {
        let now = Utc::now();
        let xml = format!(
            concat!(
                r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" "#,
                r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">"#,
                r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
                r#"<saml:Assertion>"#,
                r#"<saml:Subject><saml:NameID>a@example.com</saml:NameID></saml:Subject>"#,
                r#"<saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}">"#,
                r#"<saml:AudienceRestriction><saml:Audience>sp</saml:Audience></saml:AudienceRestriction>"#,
                r#"</saml:Conditions></saml:Assertion></samlp:Response>"#
            ),
            status = STATUS_SUCCESS,
            nb = format_utc_rfc3339(now - chrono::Duration::minutes(1)),
            noa = format_utc_rfc3339(now + chrono::Duration::minutes(5)),
        );
        let metadata = IdpMetadata::parse(METADATA).unwrap();
        let verifier = SamlVerifier::new("sp", Arc::new(AcceptAll));

        match verifier.verify(&STANDARD.encode(xml), &metadata, now) {
            Err(SamlError::Malformed(msg)) => assert_eq!(msg, "missing Issuer"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}

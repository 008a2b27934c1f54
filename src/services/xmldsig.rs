// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Enveloped XML-DSig verification for IdP responses.
//!
//! Handles RSA signatures with a single `Reference` to either the document
//! element or an `Assertion`, canonicalized with exclusive C14N. The signed
//! fragments are cut out of the document as-is, so namespace declarations
//! inherited from ancestors are re-attached before canonicalization.

use std::collections::{BTreeMap, BTreeSet};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use openssl::hash::{hash, MessageDigest};
use openssl::sign::Verifier;
use openssl::x509::X509;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use xml_canonicalization::Canonicalizer;

use super::saml::XmlSignatureVerifier;

const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

/// Checks response signatures against the IdP's X.509 signing certificates.
#[derive(Debug, Clone, Copy, Default)]
pub struct X509SignatureVerifier;

impl XmlSignatureVerifier for X509SignatureVerifier {
    fn verify(&self, xml: &str, certificates: &[String]) -> Result<(), String> {
        if certificates.is_empty() {
            return Err("no IdP signing certificate".to_string());
        }

        let signature = SignatureInfo::extract(xml)?;
        signature.check_reference_digest(xml)?;

        let (start, end) = element_span(xml, &signature.signed_info_name, 0, false)
            .ok_or("SignedInfo not found")?;
        let signed_info = canonicalize(&with_namespaces(
            &xml[start..end],
            &signature.namespaces,
        )?)?;

        let digest = signature_digest(&signature.signature_method)?;
        let value = STANDARD
            .decode(strip_whitespace(&signature.signature_value))
            .map_err(|e| format!("Invalid signature encoding: {}", e))?;

        let mut last_error = String::new();
        for certificate in certificates {
            match verify_with_certificate(certificate, digest, signed_info.as_bytes(), &value) {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

fn verify_with_certificate(
    certificate: &str,
    digest: MessageDigest,
    data: &[u8],
    signature: &[u8],
) -> Result<(), String> {
    let der = STANDARD
        .decode(strip_whitespace(certificate))
        .map_err(|e| format!("Invalid certificate encoding: {}", e))?;
    let cert = X509::from_der(&der).map_err(|e| format!("Invalid certificate: {}", e))?;
    let public_key = cert
        .public_key()
        .map_err(|e| format!("Invalid certificate: {}", e))?;

    let mut verifier =
        Verifier::new(digest, &public_key).map_err(|e| format!("Verifier creation failed: {}", e))?;
    verifier
        .update(data)
        .map_err(|e| format!("Signature update failed: {}", e))?;
    match verifier.verify(signature) {
        Ok(true) => Ok(()),
        Ok(false) => Err("signature does not match".to_string()),
        Err(e) => Err(format!("Signature verification failed: {}", e)),
    }
}

/// The first XML-DSig `Signature` of a document and the context needed to
/// check it.
#[derive(Debug, Default)]
struct SignatureInfo {
    /// Namespace prefix to URI, first declaration wins ("" is the default).
    namespaces: BTreeMap<String, String>,
    signature_name: String,
    signed_info_name: String,
    references: usize,
    reference_uri: String,
    digest_method: String,
    digest_value: String,
    signature_method: String,
    signature_value: String,
    /// Qualified names of elements carrying an `ID`, keyed by that ID.
    ids: BTreeMap<String, String>,
    root_id: Option<String>,
}

impl SignatureInfo {
    fn extract(xml: &str) -> Result<Self, String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut info = SignatureInfo::default();
        let mut stack: Vec<String> = Vec::new();
        // Depth at which the signature element was opened, while inside it.
        let mut signature_depth: Option<usize> = None;
        let mut signature_done = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let local = info.element(&e, stack.is_empty(), signature_depth.is_some())?;
                    if local == "Signature" && signature_depth.is_none() && !signature_done {
                        if info.in_dsig_namespace(&e) {
                            info.signature_name = qualified_name(&e);
                            signature_depth = Some(stack.len());
                        }
                    } else if local == "SignedInfo" && signature_depth.is_some() {
                        info.signed_info_name = qualified_name(&e);
                    }
                    stack.push(local);
                }
                Ok(Event::Empty(e)) => {
                    info.element(&e, stack.is_empty(), signature_depth.is_some())?;
                }
                Ok(Event::Text(t)) => {
                    if signature_depth.is_some() {
                        let text = t.unescape().map_err(|e| e.to_string())?;
                        match stack.last().map(String::as_str) {
                            Some("DigestValue") => info.digest_value.push_str(&text),
                            Some("SignatureValue") => info.signature_value.push_str(&text),
                            _ => {}
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                    if signature_depth == Some(stack.len()) {
                        signature_depth = None;
                        signature_done = true;
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(format!("XML parse error: {}", e)),
                _ => {}
            }
        }

        if info.signature_name.is_empty() {
            return Err("response is not signed".to_string());
        }
        if info.signed_info_name.is_empty() {
            return Err("No SignedInfo element found".to_string());
        }
        if info.references != 1 {
            return Err(format!("expected one Reference, found {}", info.references));
        }
        if info.signature_value.trim().is_empty() {
            return Err("No SignatureValue element found".to_string());
        }
        Ok(info)
    }

    /// Record namespaces, IDs and signature fields of one element; returns
    /// its local name.
    fn element(
        &mut self,
        e: &BytesStart<'_>,
        is_root: bool,
        in_signature: bool,
    ) -> Result<String, String> {
        let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

        for attr in e.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();

            if key == "xmlns" {
                self.namespaces.entry(String::new()).or_insert(value);
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                self.namespaces.entry(prefix.to_string()).or_insert(value);
            } else if key == "ID" {
                if self.ids.insert(value.clone(), qualified_name(e)).is_some() {
                    return Err(format!("duplicate ID {}", value));
                }
                if is_root {
                    self.root_id = Some(value);
                }
            } else if in_signature {
                match (local.as_str(), key.as_str()) {
                    ("Reference", "URI") => self.reference_uri = value,
                    ("DigestMethod", "Algorithm") => self.digest_method = value,
                    ("SignatureMethod", "Algorithm") => self.signature_method = value,
                    _ => {}
                }
            }
        }
        if in_signature && local == "Reference" {
            self.references += 1;
        }
        Ok(local)
    }

    fn in_dsig_namespace(&self, e: &BytesStart<'_>) -> bool {
        let name = qualified_name(e);
        let prefix = name.split_once(':').map_or("", |(p, _)| p);
        let own = e.attributes().flatten().find_map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let declares = if prefix.is_empty() {
                key == "xmlns"
            } else {
                key.strip_prefix("xmlns:") == Some(prefix)
            };
            declares.then(|| String::from_utf8_lossy(&attr.value).into_owned())
        });
        own.as_deref().or(self.namespaces.get(prefix).map(String::as_str)) == Some(XMLDSIG_NS)
    }

    /// Recompute the digest of the referenced element with the signature
    /// removed and compare it to `DigestValue`.
    fn check_reference_digest(&self, xml: &str) -> Result<(), String> {
        let id = self
            .reference_uri
            .strip_prefix('#')
            .filter(|id| !id.is_empty())
            .ok_or_else(|| format!("unsupported Reference URI '{}'", self.reference_uri))?;
        let name = self
            .ids
            .get(id)
            .ok_or_else(|| format!("Referenced element not found: {}", id))?;

        let is_root = self.root_id.as_deref() == Some(id);
        let local = name.rsplit(':').next().unwrap_or(name);
        if !is_root && local != "Assertion" {
            return Err(format!("signature covers unexpected element {}", name));
        }

        let start = find_id_attribute(xml, id).ok_or("Referenced element not found")?;
        let open = xml[..start].rfind('<').ok_or("Referenced element not found")?;
        let (open, end) =
            element_span(xml, name, open, is_root).ok_or("Cannot find element end")?;

        let mut element = xml[open..end].to_string();
        let (sig_start, sig_end) = element_span(xml, &self.signature_name, 0, false)
            .ok_or("Signature element not found")?;
        if sig_start > open && sig_end <= end {
            element.replace_range(sig_start - open..sig_end - open, "");
        }

        let canonical = canonicalize(&with_namespaces(&element, &self.namespaces)?)?;
        let digest = hash(reference_digest(&self.digest_method)?, canonical.as_bytes())
            .map_err(|e| format!("Hash failed: {}", e))?;
        if STANDARD.encode(digest) != strip_whitespace(&self.digest_value) {
            return Err("Digest mismatch".to_string());
        }
        Ok(())
    }
}

fn qualified_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn find_id_attribute(xml: &str, id: &str) -> Option<usize> {
    xml.find(&format!("ID=\"{}\"", id))
        .or_else(|| xml.find(&format!("ID='{}'", id)))
}

/// Byte span of the element named `name` whose start tag is at or after
/// `from`. `last` matches the final closing tag, for the document element.
fn element_span(xml: &str, name: &str, from: usize, last: bool) -> Option<(usize, usize)> {
    let open = format!("<{}", name);
    let mut search = from;
    let start = loop {
        let pos = search + xml[search..].find(&open)?;
        let next = xml[pos + open.len()..].chars().next()?;
        if next.is_whitespace() || next == '>' || next == '/' {
            break pos;
        }
        search = pos + open.len();
    };

    let close = format!("</{}>", name);
    let close_at = if last {
        xml.rfind(&close).filter(|&p| p > start)?
    } else {
        start + xml[start..].find(&close)?
    };
    Some((start, close_at + close.len()))
}

/// Declare on the fragment's outermost element every namespace prefix it
/// uses but does not declare itself.
fn with_namespaces(fragment: &str, namespaces: &BTreeMap<String, String>) -> Result<String, String> {
    let mut reader = Reader::from_str(fragment);
    let mut used = BTreeSet::new();
    let mut declared = BTreeSet::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = qualified_name(&e);
                used.insert(name.split_once(':').map_or("", |(p, _)| p).to_string());
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| e.to_string())?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    if key == "xmlns" {
                        declared.insert(String::new());
                    } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                        declared.insert(prefix.to_string());
                    } else if let Some((prefix, _)) = key.split_once(':') {
                        if prefix != "xml" {
                            used.insert(prefix.to_string());
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parse error: {}", e)),
            _ => {}
        }
    }

    let mut declarations = String::new();
    for prefix in used.difference(&declared) {
        let Some(uri) = namespaces.get(prefix) else {
            continue;
        };
        let uri = quick_xml::escape::escape(uri.as_str());
        if prefix.is_empty() {
            declarations.push_str(&format!(" xmlns=\"{}\"", uri));
        } else {
            declarations.push_str(&format!(" xmlns:{}=\"{}\"", prefix, uri));
        }
    }
    if declarations.is_empty() {
        return Ok(fragment.to_string());
    }

    let tag_end = fragment.find('>').ok_or("unterminated start tag")?;
    let insert_at = if fragment[..tag_end].ends_with('/') {
        tag_end - 1
    } else {
        tag_end
    };
    let mut result = String::with_capacity(fragment.len() + declarations.len());
    result.push_str(&fragment[..insert_at]);
    result.push_str(&declarations);
    result.push_str(&fragment[insert_at..]);
    Ok(result)
}

/// Exclusive XML canonicalization without comments.
fn canonicalize(xml: &str) -> Result<String, String> {
    let mut output = Vec::new();
    Canonicalizer::read_from_str(xml)
        .write_to_writer(&mut output)
        .canonicalize(false)
        .map_err(|e| format!("Canonicalization failed: {}", e))?;
    String::from_utf8(output).map_err(|e| format!("Invalid UTF-8: {}", e))
}

fn reference_digest(algorithm: &str) -> Result<MessageDigest, String> {
    match algorithm {
        "http://www.w3.org/2001/04/xmlenc#sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2000/09/xmldsig#sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmldsig-more#sha384" => Ok(MessageDigest::sha384()),
        "http://www.w3.org/2001/04/xmlenc#sha512" => Ok(MessageDigest::sha512()),
        other => Err(format!("Unsupported digest algorithm: {}", other)),
    }
}

fn signature_digest(algorithm: &str) -> Result<MessageDigest, String> {
    match algorithm {
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2000/09/xmldsig#rsa-sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384" => Ok(MessageDigest::sha384()),
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512" => Ok(MessageDigest::sha512()),
        other => Err(format!("Unsupported signature algorithm: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::saml::{IdpMetadata, SamlVerifier};
    use crate::time_utils::format_utc_rfc3339;
    use chrono::{Duration, Utc};
    use openssl::asn1::Asn1Time;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::sign::Signer;
    use openssl::x509::{X509Builder, X509NameBuilder};
    use std::sync::Arc;

    const IDP_ENTITY: &str = "https://idp.example.com";
    const SP_ENTITY: &str = "https://api.example.com/saml";

    struct Idp {
        key: PKey<Private>,
        certificate: String,
    }

    fn idp() -> Idp {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "idp.example.com").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        Idp {
            key,
            certificate: STANDARD.encode(builder.build().to_der().unwrap()),
        }
    }

    fn response_parts(name_id: &str) -> (String, String, String, String) {
        let now = Utc::now();
        let open = concat!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" "#,
            r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r1" Version="2.0">"#,
            r#"<saml:Issuer>https://idp.example.com</saml:Issuer>"#,
            r#"<samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>"#
        )
        .to_string();
        let head = format!(
            r#"<saml:Assertion ID="_a1" Version="2.0"><saml:Issuer>{}</saml:Issuer>"#,
            IDP_ENTITY
        );
        let tail = format!(
            concat!(
                r#"<saml:Subject><saml:NameID>{name_id}</saml:NameID></saml:Subject>"#,
                r#"<saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}">"#,
                r#"<saml:AudienceRestriction><saml:Audience>{aud}</saml:Audience></saml:AudienceRestriction>"#,
                r#"</saml:Conditions></saml:Assertion>"#
            ),
            name_id = name_id,
            nb = format_utc_rfc3339(now - Duration::minutes(1)),
            noa = format_utc_rfc3339(now + Duration::minutes(5)),
            aud = SP_ENTITY,
        );
        (open, head, tail, "</samlp:Response>".to_string())
    }

    /// A response whose assertion carries an enveloped RSA-SHA256 signature.
    fn signed_response(idp: &Idp, name_id: &str) -> String {
        let (open, head, tail, close) = response_parts(name_id);
        let mut namespaces = BTreeMap::new();
        namespaces.insert("samlp".to_string(), "urn:oasis:names:tc:SAML:2.0:protocol".to_string());
        namespaces.insert("saml".to_string(), "urn:oasis:names:tc:SAML:2.0:assertion".to_string());
        namespaces.insert("ds".to_string(), XMLDSIG_NS.to_string());

        let assertion = format!("{}{}", head, tail);
        let canonical = canonicalize(&with_namespaces(&assertion, &namespaces).unwrap()).unwrap();
        let digest = STANDARD.encode(hash(MessageDigest::sha256(), canonical.as_bytes()).unwrap());

        let signed_info = format!(
            concat!(
                r#"<ds:SignedInfo>"#,
                r#"<ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/>"#,
                r#"<ds:SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"/>"#,
                r##"<ds:Reference URI="#_a1"><ds:Transforms>"##,
                r#"<ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/>"#,
                r#"<ds:Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/>"#,
                r#"</ds:Transforms>"#,
                r#"<ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/>"#,
                r#"<ds:DigestValue>{}</ds:DigestValue></ds:Reference></ds:SignedInfo>"#
            ),
            digest
        );
        let canonical = canonicalize(&with_namespaces(&signed_info, &namespaces).unwrap()).unwrap();
        let mut signer = Signer::new(MessageDigest::sha256(), &idp.key).unwrap();
        signer.update(canonical.as_bytes()).unwrap();
        let value = STANDARD.encode(signer.sign_to_vec().unwrap());

        let signature = format!(
            concat!(
                r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">{}"#,
                r#"<ds:SignatureValue>{}</ds:SignatureValue>"#,
                r#"<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>"#,
                r#"</ds:Signature>"#
            ),
            signed_info, value, idp.certificate
        );
        format!("{}{}{}{}{}", open, head, signature, tail, close)
    }

    #[test]
    fn test_accepts_signed_response() {
        let idp = idp();
        let xml = signed_response(&idp, "ada@example.com");
        assert_eq!(
            X509SignatureVerifier.verify(&xml, &[idp.certificate.clone()]),
            Ok(())
        );
    }

    #[test]
    fn test_rejects_modified_assertion() {
        let idp = idp();
        let xml = signed_response(&idp, "ada@example.com")
            .replace("ada@example.com</saml:NameID>", "eve@example.com</saml:NameID>");
        assert_eq!(
            X509SignatureVerifier.verify(&xml, &[idp.certificate.clone()]),
            Err("Digest mismatch".to_string())
        );
    }

    #[test]
    fn test_rejects_other_certificate() {
        let signer = idp();
        let other = idp();
        let xml = signed_response(&signer, "ada@example.com");
        assert!(X509SignatureVerifier.verify(&xml, &[other.certificate]).is_err());
        // Any one of several configured certificates may match.
        assert!(X509SignatureVerifier
            .verify(&xml, &[idp().certificate, signer.certificate.clone()])
            .is_ok());
    }

    #[test]
    fn test_rejects_unsigned_response() {
        let idp = idp();
        let (open, head, tail, close) = response_parts("ada@example.com");
        let xml = format!("{}{}{}{}", open, head, tail, close);
        assert_eq!(
            X509SignatureVerifier.verify(&xml, &[idp.certificate]),
            Err("response is not signed".to_string())
        );
    }

    #[test]
    fn test_element_span_skips_longer_names() {
        let xml = "<a><ds:SignatureValue>x</ds:SignatureValue><ds:Signature>y</ds:Signature></a>";
        let (start, end) = element_span(xml, "ds:Signature", 0, false).unwrap();
        assert_eq!(&xml[start..end], "<ds:Signature>y</ds:Signature>");
    }

    #[test]
    fn test_with_namespaces_declares_inherited_prefix() {
        let mut namespaces = BTreeMap::new();
        namespaces.insert("ds".to_string(), XMLDSIG_NS.to_string());
        let fragment = with_namespaces("<ds:SignedInfo><ds:Reference/></ds:SignedInfo>", &namespaces)
            .unwrap();
        assert_eq!(
            fragment,
            r#"<ds:SignedInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:Reference/></ds:SignedInfo>"#
        );
    }

    #[test]
    fn test_saml_verifier_with_signed_response() {
        let idp = idp();
        let metadata = IdpMetadata {
            entity_id: IDP_ENTITY.to_string(),
            sso_url: None,
            certificates: vec![idp.certificate.clone()],
        };
        let verifier = SamlVerifier::new(SP_ENTITY, Arc::new(X509SignatureVerifier));

        let encoded = STANDARD.encode(signed_response(&idp, "ada@example.com"));
        let identity = verifier.verify(&encoded, &metadata, Utc::now()).unwrap();
        assert_eq!(identity.emails[0].email, "ada@example.com");
        assert!(identity.emails[0].verified);

        let forged = STANDARD.encode(
            signed_response(&idp, "ada@example.com")
                .replace("ada@example.com</saml:NameID>", "eve@example.com</saml:NameID>"),
        );
        assert!(matches!(
            verifier.verify(&forged, &metadata, Utc::now()),
            Err(crate::services::SamlError::SignatureInvalid(_))
        ));
    }
}

//! Name rewriting for generated requests and certificates.
//!
//! rcgen keeps one value per attribute type in a distinguished name, so a
//! subject like `O=Acme,OU=Infra,OU=SRE` cannot pass through it intact.
//! Requests and certificates are generated by rcgen with a placeholder
//! name, then their name fields are replaced with DER built by
//! [`SubjectName::to_der`](crate::dn::SubjectName::to_der) and the
//! structure is signed again with the same key and algorithm.

use yasna::models::ObjectIdentifier;
use yasna::ASN1Error;

use crate::error::{Error, Result};
use crate::keys::PrivateKey;

/// Replaces the subject of a DER `CertificationRequest` and re-signs it.
///
/// # Errors
///
/// Returns [`Error::Parse`] if `der` is not a signed request, and
/// [`Error::Generation`] if `key` cannot produce the request's signature.
pub fn replace_request_subject(der: &[u8], subject: &[u8], key: &PrivateKey) -> Result<Vec<u8>> {
    let (info, algorithm) = split_signed(der)?;
    let mut fields = sequence_elements(&info)?;
    if fields.len() < 4 {
        return Err(malformed("request info has too few fields"));
    }
    fields[1] = subject.to_vec();
    resign(&fields, &algorithm, key)
}

/// Replaces the issuer and subject of a DER `Certificate` and re-signs it.
///
/// # Errors
///
/// Returns [`Error::Parse`] if `der` is not a signed certificate, and
/// [`Error::Generation`] if `key` cannot produce the certificate's
/// signature.
pub fn replace_certificate_names(
    der: &[u8],
    issuer: &[u8],
    subject: &[u8],
    key: &PrivateKey,
) -> Result<Vec<u8>> {
    let (tbs, algorithm) = split_signed(der)?;
    let mut fields = sequence_elements(&tbs)?;
    // Explicit [0] version shifts every later field by one.
    let offset = usize::from(fields.first().is_some_and(|f| f.first() == Some(&0xA0)));
    if fields.len() < offset + 6 {
        return Err(malformed("certificate body has too few fields"));
    }
    fields[offset + 2] = issuer.to_vec();
    fields[offset + 4] = subject.to_vec();
    resign(&fields, &algorithm, key)
}

/// Splits a signed structure into its body and raw `AlgorithmIdentifier`.
fn split_signed(der: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    match <[Vec<u8>; 3]>::try_from(sequence_elements(der)?) {
        Ok([body, algorithm, _signature]) => Ok((body, algorithm)),
        Err(_) => Err(malformed("expected body, algorithm and signature")),
    }
}

/// Raw TLV of every element of a DER SEQUENCE.
fn sequence_elements(der: &[u8]) -> Result<Vec<Vec<u8>>> {
    yasna::parse_der(der, |reader| {
        let mut elements = Vec::new();
        reader.read_sequence_of(|reader| {
            elements.push(reader.read_der()?);
            Ok(())
        })?;
        Ok(elements)
    })
    .map_err(asn1)
}

fn algorithm_oid(algorithm: &[u8]) -> Result<ObjectIdentifier> {
    yasna::parse_der(algorithm, |reader| {
        reader.read_sequence(|reader| {
            let oid = reader.next().read_oid()?;
            reader.read_optional(|reader| reader.read_der())?;
            Ok(oid)
        })
    })
    .map_err(asn1)
}

fn resign(fields: &[Vec<u8>], algorithm: &[u8], key: &PrivateKey) -> Result<Vec<u8>> {
    let body = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            for field in fields {
                writer.next().write_der(field);
            }
        });
    });
    let oid = algorithm_oid(algorithm)?;
    let signature = key.sign(oid.components(), &body)?;

    Ok(yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_der(&body);
            writer.next().write_der(algorithm);
            writer.next().write_bitvec_bytes(&signature, signature.len() * 8);
        });
    }))
}

fn asn1(e: ASN1Error) -> Error {
    malformed(&e.to_string())
}

fn malformed(reason: &str) -> Error {
    Error::Parse(format!("malformed DER: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::{DnTemplate, SubjectName};
    use crate::keys::MIN_KEY_BITS;
    use crate::request::RequestInfo;
    use crate::san::SubjectAltName;
    use rcgen::{CertificateParams, DistinguishedName};
    use x509_parser::prelude::{FromDer, X509Certificate};

    fn three_ous() -> SubjectName {
        DnTemplate::parse("O=Acme,OU=Infra,OU=SRE,OU=Oncall")
            .unwrap()
            .subject_for("db1")
            .unwrap()
    }

    fn request_der(key: &PrivateKey) -> Vec<u8> {
        let mut params = CertificateParams::new(vec!["db1.example.com".to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&key.to_key_pair().unwrap()).unwrap();
        csr.der().as_ref().to_vec()
    }

    #[test]
    fn replaced_request_subject_verifies_for_ec_and_rsa_keys() {
        let ec = PrivateKey::from_pem(&rcgen::KeyPair::generate().unwrap().serialize_pem()).unwrap();
        let rsa = PrivateKey::generate_rsa(MIN_KEY_BITS).unwrap();
        let subject = three_ous();

        for key in [ec, rsa] {
            let der = replace_request_subject(&request_der(&key), &subject.to_der(), &key).unwrap();
            let info = RequestInfo::from_der(&der).unwrap();
            assert_eq!(info.subject, subject);
            assert_eq!(info.subject_der, subject.to_der());
            assert_eq!(info.sans, [SubjectAltName::Dns("db1.example.com".into())]);
        }
    }

    #[test]
    fn replaced_certificate_names_verify_against_issuer() {
        let key = PrivateKey::from_pem(&rcgen::KeyPair::generate().unwrap().serialize_pem()).unwrap();
        let params = CertificateParams::new(vec!["db1.example.com".to_string()]).unwrap();
        let cert = params.self_signed(&key.to_key_pair().unwrap()).unwrap();
        let name = three_ous().to_der();

        let der = replace_certificate_names(cert.der().as_ref(), &name, &name, &key).unwrap();
        let (rest, parsed) = X509Certificate::from_der(&der).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.subject().as_raw(), name.as_slice());
        assert_eq!(parsed.issuer().as_raw(), name.as_slice());
        assert!(parsed.verify_signature(None).is_ok());
        assert_eq!(SubjectName::from_x509(parsed.subject()).unwrap(), three_ous());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let key = PrivateKey::generate_rsa(MIN_KEY_BITS).unwrap();
        assert!(matches!(
            replace_request_subject(b"\x30\x03\x02\x01\x05", b"", &key),
            Err(Error::Parse(_))
        ));
    }
}

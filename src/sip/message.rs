//! Thin accessors over `rsip::Request` / `rsip::Response`.
//!
//! Everything here is read-only inspection; request and response
//! *construction* is the transaction manager's job (see
//! [`super::transaction`]), since building a correct Via/branch/CSeq
//! requires transport state this module does not have.

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Param};

use crate::error::{Error, Result};

/// The registered SIP field name for a header (e.g. `Contact`, `Record-Route`),
/// derived from its `"Name: value"` `Display` rendering since `rsip::Header`
/// does not expose the name directly.
pub(crate) fn header_field_name(h: &Header) -> String {
    h.to_string().split(':').next().unwrap_or("").trim().to_string()
}

/// An inbound or outbound SIP request, wrapped for the call-control layer.
#[derive(Debug, Clone)]
pub struct SipRequest(pub rsip::Request);

/// An inbound or outbound SIP response, wrapped for the call-control layer.
#[derive(Debug, Clone)]
pub struct SipResponse(pub rsip::Response);

impl From<rsip::Request> for SipRequest {
    fn from(req: rsip::Request) -> Self {
        Self(req)
    }
}

impl From<rsip::Response> for SipResponse {
    fn from(resp: rsip::Response) -> Self {
        Self(resp)
    }
}

impl SipRequest {
    pub fn method(&self) -> &rsip::Method {
        &self.0.method
    }

    pub fn call_id(&self) -> Result<String> {
        Ok(self.0.call_id_header().map_err(|e| Error::sip(e.to_string()))?.value().to_string())
    }

    pub fn cseq(&self) -> Result<u32> {
        self.0
            .cseq_header()
            .map_err(|e| Error::sip(e.to_string()))?
            .seq()
            .map_err(|e| Error::sip(e.to_string()))
    }

    /// The `tag` parameter of the From header, if set (RFC 3261 §8.1.1.3
    /// requires it on every request, so absence is itself a parse issue).
    pub fn from_tag(&self) -> Result<Option<String>> {
        let from = self
            .0
            .from_header()
            .map_err(|e| Error::sip(e.to_string()))?
            .typed()
            .map_err(|e| Error::sip(e.to_string()))?;
        Ok(from.tag().map(|t| t.to_string()))
    }

    /// The `tag` parameter of the To header. An initial INVITE has none;
    /// a request carrying one identifies an existing dialog (the 481
    /// check in the dispatcher keys off this).
    pub fn to_tag(&self) -> Result<Option<String>> {
        let to = self
            .0
            .to_header()
            .map_err(|e| Error::sip(e.to_string()))?
            .typed()
            .map_err(|e| Error::sip(e.to_string()))?;
        Ok(to.tag().map(|t| t.to_string()))
    }

    pub fn has_to_tag(&self) -> bool {
        matches!(self.to_tag(), Ok(Some(_)))
    }

    fn via_headers(&self) -> Vec<&rsip::headers::Via> {
        self.0
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::Via(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    /// The host:port a response to this request should be routed to.
    ///
    /// When a request has passed through one upstream proxy it carries two
    /// Via headers; the proxy added the top one, so the client's own
    /// address is in the second. When there is only one Via, that one IS
    /// the client's address. Relying on the Request-URI or source address
    /// instead is wrong once NAT or a load balancer is in the path, which
    /// is why this falls back to the second Via rather than the first
    /// whenever one is available.
    pub fn via_remote_addr(&self) -> Result<String> {
        let vias = self.via_headers();
        let via = if vias.len() > 1 { vias.get(1) } else { vias.first() };
        let via = via.ok_or_else(|| Error::sip("request carries no Via header"))?;
        let typed = via.typed().map_err(|e| Error::sip(e.to_string()))?;
        Ok(typed.uri.host().to_string())
    }

    pub fn record_route_values(&self) -> Vec<String> {
        self.0
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(rr) => Some(rr.value().to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn contact_value(&self) -> Result<String> {
        Ok(self
            .0
            .contact_header()
            .map_err(|e| Error::sip(e.to_string()))?
            .value()
            .to_string())
    }

    /// Copy a fixed set of headers verbatim from this request onto another,
    /// used to carry P-Asserted-Identity / Diversion / etc. from the A-leg
    /// INVITE onto the B-leg INVITE (`SipConfig::pass_through_headers`).
    pub fn copy_headers_by_name(&self, names: &[String], into: &mut rsip::Request) {
        for h in self.0.headers.iter() {
            let field_name = header_field_name(h);
            if names.iter().any(|n| n.eq_ignore_ascii_case(&field_name)) {
                into.headers.push(h.clone());
            }
        }
    }

    pub fn raw_uri(&self) -> &rsip::Uri {
        &self.0.uri
    }
}

impl SipResponse {
    pub fn status_code(&self) -> &rsip::StatusCode {
        &self.0.status_code
    }

    pub fn status_code_u16(&self) -> u16 {
        self.0.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        let code = self.status_code_u16();
        (100..200).contains(&code)
    }

    pub fn is_success(&self) -> bool {
        let code = self.status_code_u16();
        (200..300).contains(&code)
    }

    pub fn is_redirect(&self) -> bool {
        let code = self.status_code_u16();
        (300..400).contains(&code)
    }

    pub fn to_tag(&self) -> Result<Option<String>> {
        let to = self
            .0
            .to_header()
            .map_err(|e| Error::sip(e.to_string()))?
            .typed()
            .map_err(|e| Error::sip(e.to_string()))?;
        Ok(to.tag().map(|t| t.to_string()))
    }

    /// Contact URIs carried on a 3xx, in header order; `300 Multiple
    /// Choices` may list several, everything else effectively has at
    /// most one that matters.
    pub fn contact_uris(&self) -> Vec<String> {
        self.0
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::Contact(c) => Some(c.value().to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn record_route_values(&self) -> Vec<String> {
        self.0
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(rr) => Some(rr.value().to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn reason_phrase(&self) -> String {
        self.0.status_code.to_string()
    }

    pub fn has_tag_param(headers: &[Param]) -> bool {
        headers.iter().any(|p| matches!(p, Param::Tag(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::{CallId, From as FromHeader, To as ToHeader};
    use rsip::{Method, Request, Version};

    fn sample_invite(to_tag: Option<&str>) -> Request {
        let to_value = match to_tag {
            Some(tag) => format!("<sip:bob@example.com>;tag={}", tag),
            None => "<sip:bob@example.com>".to_string(),
        };
        Request {
            method: Method::Invite,
            uri: "sip:bob@example.com".try_into().unwrap(),
            version: Version::V2,
            headers: vec![
                Header::From(FromHeader::from("<sip:alice@example.com>;tag=abc123")),
                Header::To(ToHeader::from(to_value)),
                Header::CallId(CallId::from("call-1@example.com")),
                Header::Via("SIP/2.0/UDP proxy.example.com;branch=z9hG4bK1".into()),
                Header::Via("SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK0".into()),
            ]
            .into(),
            body: Default::default(),
        }
    }

    #[test]
    fn initial_invite_has_no_to_tag() {
        let req = SipRequest::from(sample_invite(None));
        assert!(!req.has_to_tag());
    }

    #[test]
    fn mid_dialog_request_carries_to_tag() {
        let req = SipRequest::from(sample_invite(Some("xyz789")));
        assert!(req.has_to_tag());
        assert_eq!(req.to_tag().unwrap().as_deref(), Some("xyz789"));
    }

    #[test]
    fn via_remote_addr_prefers_second_via_when_present() {
        let req = SipRequest::from(sample_invite(None));
        assert_eq!(req.via_remote_addr().unwrap(), "10.0.0.5");
    }

    #[test]
    fn via_remote_addr_falls_back_to_only_via() {
        let mut req = sample_invite(None);
        req.headers = req
            .headers
            .into_iter()
            .filter(|h| !matches!(h, Header::Via(v) if v.to_string().contains("10.0.0.5")))
            .collect();
        let req = SipRequest::from(req);
        assert_eq!(req.via_remote_addr().unwrap(), "proxy.example.com");
    }
}

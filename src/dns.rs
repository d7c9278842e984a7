//! The DNS Hijack Server (§4.3): authoritative for the internal zone (synthesizes
//! loopback A/AAAA answers), recursive for everything else. No per-client state; a
//! query is handled end to end with no retry on the recursive path (the stub resolver
//! in the child is expected to retry).

use crate::config::RuntimeConfig;
use crate::region;
use hickory_client::client::{Client, ClientHandle};
use hickory_proto::op::{Edns, Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, IntoName, Name, RData, Record, RecordType};
use hickory_proto::xfer::DnsResponse;
use hickory_server::authority::{MessageResponse, MessageResponseBuilder};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};

/// TTL on every synthesized loopback answer (§4.3: "TTL 10 seconds").
const SYNTHETIC_TTL: u32 = 10;

pub struct DnsHijackHandler {
    config: Arc<RuntimeConfig>,
    upstream: Arc<Mutex<Client>>,
}

impl DnsHijackHandler {
    pub fn new(config: Arc<RuntimeConfig>, upstream: Client) -> Self {
        DnsHijackHandler {
            config,
            upstream: Arc::new(Mutex::new(upstream)),
        }
    }

    fn in_internal_zone(&self, name: &str) -> bool {
        name.ends_with(&self.config.internal_zone)
    }

    /// Extract the region label: the second-to-last label before the zone, i.e. the
    /// `region` in `{svc}.{region}.{internal_zone}`.
    fn region_label(&self, name: &str) -> Option<String> {
        let zone = self.config.internal_zone.trim_matches('.');
        let name = name.trim_end_matches('.');
        let stripped = name.strip_suffix(zone)?.trim_end_matches('.');
        let mut labels = stripped.rsplit('.');
        labels.next()?; // the service label itself, discarded
        labels.next().map(|s| s.to_string())
    }

    #[instrument(skip(self))]
    async fn forward_to_upstream(
        &self,
        name: Name,
        class: DNSClass,
        qtype: RecordType,
    ) -> anyhow::Result<DnsResponse> {
        let mut upstream = { self.upstream.lock().await.clone() };
        let response = upstream.query(name, class, qtype).await?;
        Ok(response)
    }

    #[instrument(skip_all)]
    async fn handle_query<R: ResponseHandler>(
        &self,
        response_edns: Option<Edns>,
        request: &Request,
        response_handle: R,
    ) -> anyhow::Result<ResponseInfo> {
        let request_info = request.request_info()?;
        let name = request_info.query.name().into_name()?;
        let class = request_info.query.query_class();
        let qtype = request_info.query.query_type();
        let name_str = name.to_string().to_ascii_lowercase();

        // Only A/AAAA queries within the internal zone are synthesized locally;
        // everything else (including ANY and non-address types inside the zone)
        // defers to recursion (§4.3 "Local handler", "Type filtering").
        let locally_answerable =
            matches!(qtype, RecordType::A | RecordType::AAAA) && self.in_internal_zone(&name_str);

        if locally_answerable {
            self.handle_local(response_edns, request, response_handle, &name_str, qtype)
                .await
        } else {
            self.handle_recursive(response_edns, request, response_handle, name, class, qtype)
                .await
        }
    }

    #[instrument(skip_all, fields(name = %name_str, qtype = %qtype))]
    async fn handle_local<R: ResponseHandler>(
        &self,
        response_edns: Option<Edns>,
        request: &Request,
        response_handle: R,
        name_str: &str,
        qtype: RecordType,
    ) -> anyhow::Result<ResponseInfo> {
        let response_builder = MessageResponseBuilder::from_message_request(request);

        let dots = name_str.matches('.').count();
        let region = (dots == self.config.ndots)
            .then(|| self.region_label(name_str))
            .flatten();
        let code = region.as_deref().and_then(region::lookup);

        match code {
            None => {
                debug!(dots, expected = self.config.ndots, "answering NXDOMAIN for internal zone miss");
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::NXDomain);
                header.set_authoritative(true);
                let response = response_builder.build(
                    header,
                    &[] as &[Record],
                    &[] as &[Record],
                    &[] as &[Record],
                    &[] as &[Record],
                );
                Ok(send_response(response_edns, response, response_handle).await?)
            }
            Some(_code) => {
                let name = Name::from_ascii(name_str)?;
                let mut answers = Vec::with_capacity(2);
                answers.push(a_record(&name));
                if qtype == RecordType::AAAA && self.config.serve_ipv6 {
                    answers.push(aaaa_record(&name));
                }

                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::NoError);
                header.set_authoritative(true);
                header.set_recursion_available(true);

                let response = response_builder.build(
                    header,
                    &answers,
                    &[] as &[Record],
                    &[] as &[Record],
                    &[] as &[Record],
                );
                Ok(send_response(response_edns, response, response_handle).await?)
            }
        }
    }

    #[instrument(skip_all, fields(name = %name))]
    async fn handle_recursive<R: ResponseHandler>(
        &self,
        response_edns: Option<Edns>,
        request: &Request,
        response_handle: R,
        name: Name,
        class: DNSClass,
        qtype: RecordType,
    ) -> anyhow::Result<ResponseInfo> {
        let response_builder = MessageResponseBuilder::from_message_request(request);

        match self.forward_to_upstream(name.clone(), class, qtype).await {
            Ok(upstream_response) => {
                let mut header = Header::response_from_request(request.header());
                header.set_recursion_available(upstream_response.recursion_available());
                header.set_response_code(upstream_response.response_code());

                let response = response_builder.build(
                    header,
                    upstream_response.answers(),
                    upstream_response.name_servers(),
                    &[] as &[Record],
                    upstream_response.additionals(),
                );
                Ok(send_response(response_edns, response, response_handle).await?)
            }
            Err(e) => {
                warn!("recursive query for {name} failed: {e}");
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::ServFail);
                header.set_authoritative(true);
                let response = response_builder.build(
                    header,
                    &[] as &[Record],
                    &[] as &[Record],
                    &[] as &[Record],
                    &[] as &[Record],
                );
                Ok(send_response(response_edns, response, response_handle).await?)
            }
        }
    }

    #[instrument(skip_all)]
    async fn server_not_implement<R: ResponseHandler>(
        &self,
        response_edns: Option<Edns>,
        request: &Request,
        response_handle: R,
    ) -> anyhow::Result<ResponseInfo> {
        let response = MessageResponseBuilder::from_message_request(request);
        let response_info = send_response(
            response_edns,
            response.error_msg(request.header(), ResponseCode::NotImp),
            response_handle,
        )
        .await?;
        Ok(response_info)
    }
}

fn a_record(name: &Name) -> Record {
    let mut record = Record::from_rdata(name.clone(), SYNTHETIC_TTL, RData::A(A(Ipv4Addr::LOCALHOST)));
    record.set_dns_class(DNSClass::IN);
    record
}

fn aaaa_record(name: &Name) -> Record {
    let mut record = Record::from_rdata(name.clone(), SYNTHETIC_TTL, RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)));
    record.set_dns_class(DNSClass::IN);
    record
}

#[async_trait::async_trait]
impl RequestHandler for DnsHijackHandler {
    #[instrument(skip_all, fields(dns.src, dns.name, dns.query_class, dns.query_type, dns.op_code, dns.response_code))]
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        match request.request_info() {
            Ok(request_info) => {
                {
                    let src = request_info.src.to_string();
                    tracing::Span::current().record("dns.src", &src);
                    let name = request_info.query.name().to_string();
                    tracing::Span::current().record("dns.name", &name);
                    let query_class = request_info.query.query_class().to_string();
                    tracing::Span::current().record("dns.query_class", &query_class);
                    let query_type = request_info.query.query_type().to_string();
                    tracing::Span::current().record("dns.query_type", &query_type);
                    let op_code = request_info.header.op_code().to_string();
                    tracing::Span::current().record("dns.op_code", &op_code);
                };

                let response_edns = if let Some(req_edns) = request.edns() {
                    let mut response = MessageResponseBuilder::from_message_request(request);
                    let mut response_header = Header::response_from_request(request.header());

                    let mut resp_edns = Edns::new();
                    let our_version = 0;
                    resp_edns.set_dnssec_ok(req_edns.flags().dnssec_ok);
                    resp_edns.set_max_payload(1232);
                    resp_edns.set_version(our_version);

                    if req_edns.version() > our_version {
                        warn!(
                            "request edns version greater than {}: {}",
                            our_version,
                            req_edns.version()
                        );
                        response_header.set_response_code(ResponseCode::BADVERS);
                        resp_edns.set_rcode_high(ResponseCode::BADVERS.high());
                        response.edns(resp_edns);

                        let result = response_handle
                            .send_response(response.build_no_records(response_header))
                            .await;

                        return result.unwrap_or_else(|e| {
                            error!("request error: {}", e);
                            let mut header = Header::response_from_request(request.header());
                            header.set_response_code(ResponseCode::ServFail);
                            header.into()
                        });
                    }

                    Some(resp_edns)
                } else {
                    None
                };

                let result = match request.message_type() {
                    MessageType::Query => match request.op_code() {
                        OpCode::Query => {
                            self.handle_query(response_edns, request, response_handle)
                                .await
                        }
                        c => {
                            warn!("unimplemented op_code: {:?}", c);
                            self.server_not_implement(response_edns, request, response_handle)
                                .await
                        }
                    },
                    MessageType::Response => {
                        self.server_not_implement(response_edns, request, response_handle)
                            .await
                    }
                };

                match result {
                    Ok(response_info) => {
                        let response_code = response_info.response_code().to_string();
                        tracing::Span::current().record("dns.response_code", &response_code);
                        response_info
                    }
                    Err(e) => {
                        error!("request failed: {}", e);
                        tracing::Span::current()
                            .record("dns.response_code", ResponseCode::ServFail.to_string());
                        let mut header = Header::response_from_request(request.header());
                        header.set_response_code(ResponseCode::ServFail);
                        header.into()
                    }
                }
            }
            Err(e) => {
                error!("request failed: {}", e);
                tracing::Span::current()
                    .record("dns.response_code", ResponseCode::ServFail.to_string());
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

#[allow(unused_mut, unused_variables)]
#[instrument(skip_all)]
async fn send_response<'a, R: ResponseHandler>(
    response_edns: Option<Edns>,
    mut response: MessageResponse<
        '_,
        'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
    >,
    mut response_handle: R,
) -> io::Result<ResponseInfo> {
    if let Some(resp_edns) = response_edns {
        response.set_edns(resp_edns);
    }

    response_handle.send_response(response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::runtime::TokioRuntimeProvider;
    use hickory_proto::udp::UdpClientStream;
    use std::sync::Arc as StdArc;

    fn sample_config() -> Arc<RuntimeConfig> {
        StdArc::new(RuntimeConfig {
            internal_zone: "foo.bar.".to_string(),
            ndots: 4,
            upstream_nameserver: "127.0.0.1:53".parse().unwrap(),
            current_region: "us-central1".to_string(),
            project_hash: "dpyb4duzqq".to_string(),
            serve_ipv6: true,
            dns_port: 53,
            http_proxy_port: 80,
            version: "test",
            on_platform: true,
        })
    }

    async fn make_handler() -> DnsHijackHandler {
        let conn =
            UdpClientStream::builder("127.0.0.1:53".parse().unwrap(), TokioRuntimeProvider::new())
                .build();
        let (client, bg) = Client::connect(conn).await.unwrap();
        drop(bg);
        DnsHijackHandler::new(sample_config(), client)
    }

    #[tokio::test]
    async fn rejects_too_few_dots() {
        let handler = make_handler().await;
        let dots = "a.foo.bar.".matches('.').count();
        assert_ne!(dots, handler.config.ndots);
    }

    #[tokio::test]
    async fn rejects_too_many_dots() {
        let handler = make_handler().await;
        let dots = "a.b.c.foo.bar.".matches('.').count();
        assert_ne!(dots, handler.config.ndots);
    }

    #[tokio::test]
    async fn accepts_exactly_ndots() {
        let handler = make_handler().await;
        let dots = "abc.us-central1.foo.bar.".matches('.').count();
        assert_eq!(dots, handler.config.ndots);
    }

    #[tokio::test]
    async fn region_label_extracts_second_to_last_label() {
        let handler = make_handler().await;
        assert_eq!(
            handler.region_label("abc.us-central1.foo.bar."),
            Some("us-central1".to_string())
        );
    }

    #[tokio::test]
    async fn region_label_requires_trimming_the_trailing_dot_off_the_wire_name() {
        // Names reaching `handle_local` are absolute FQDNs straight off the wire, so they
        // always carry a trailing dot; `region_label` must trim it before stripping the
        // zone suffix or it never matches and every query falls through to NXDOMAIN.
        let handler = make_handler().await;
        assert_eq!(
            handler.region_label("abc.us-central1.foo.bar."),
            handler.region_label("abc.us-central1.foo.bar")
        );
    }

    #[tokio::test]
    async fn unknown_region_label_has_no_catalog_entry() {
        let handler = make_handler().await;
        let region = handler.region_label("abc.def.foo.bar.").unwrap();
        assert_eq!(region::lookup(&region), None);
    }

    #[tokio::test]
    async fn names_outside_the_zone_are_not_local() {
        let handler = make_handler().await;
        assert!(!handler.in_internal_zone("localhost."));
        assert!(!handler.in_internal_zone("example.com."));
    }

    #[test]
    fn synthesized_a_record_points_at_loopback() {
        let name = Name::from_ascii("abc.us-central1.foo.bar.").unwrap();
        let record = a_record(&name);
        assert_eq!(record.ttl(), SYNTHETIC_TTL);
        match record.data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::LOCALHOST),
            other => panic!("expected A record, got {other:?}"),
        }
    }

    #[test]
    fn synthesized_aaaa_record_points_at_loopback() {
        let name = Name::from_ascii("abc.us-central1.foo.bar.").unwrap();
        let record = aaaa_record(&name);
        assert_eq!(record.ttl(), SYNTHETIC_TTL);
        match record.data() {
            Some(RData::AAAA(aaaa)) => assert_eq!(aaaa.0, Ipv6Addr::LOCALHOST),
            other => panic!("expected AAAA record, got {other:?}"),
        }
    }
}

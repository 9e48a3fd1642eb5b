use anyhow::{anyhow, Result};
use hickory_proto::op::{Edns, Message, MessageType, Query};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::{Name, RecordType};

use crate::config::Config;

/// Default EDNS0 payload size advertised when an OPT record is required
/// but no explicit buffer size was configured.
const DEFAULT_EDNS_PAYLOAD: u16 = 1232;

/// Build a single-question query message.
///
/// The caller supplies the message ID: workers draw it from their PRNG,
/// except over QUIC where RFC 9250 requires ID 0. An OPT pseudo-record is
/// attached when an EDNS buffer size, a local EDNS option, or the DO bit
/// is configured.
pub fn build_request(fqdn: &str, qtype: RecordType, id: u16, config: &Config) -> Result<Message> {
	let name = Name::from_ascii(fqdn)
		.map_err(|e| anyhow!("invalid domain name '{}': {}", fqdn, e))?;

	let mut message = Message::new();
	message.set_id(id);
	message.set_recursion_desired(config.recursion_desired);
	message.add_query(Query::query(name, qtype));

	if config.edns_size > 0 || config.edns_opt.is_some() || config.dnssec {
		let mut edns = Edns::new();
		edns.set_version(0);
		edns.set_max_payload(if config.edns_size > 0 {
			config.edns_size
		} else {
			DEFAULT_EDNS_PAYLOAD
		});
		edns.set_dnssec_ok(config.dnssec);
		if let Some((code, data)) = &config.edns_opt {
			edns.options_mut().insert(EdnsOption::Unknown(*code, data.clone()));
		}
		*message.extensions_mut() = Some(edns);
	}

	Ok(message)
}

/// Render the response code of a received message for taps and logs.
pub fn rcode_str(response: &Message) -> String {
	format!("{}", response.response_code())
}

/// True when the message is a response rather than an echoed query.
pub fn is_response(message: &Message) -> bool {
	message.message_type() == MessageType::Response
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::rr::rdata::opt::EdnsCode;

	use crate::config::{DohMethod, HttpVersion, Protocol, RequestDelay};

	fn test_config() -> Config {
		Config {
			server: "127.0.0.1:53".to_string(),
			protocol: Protocol::Udp,
			doh_method: DohMethod::Post,
			http_version: HttpVersion::Http2,
			qtypes: vec![RecordType::A],
			count: 1,
			duration: None,
			concurrency: 1,
			rate_limit: 0,
			rate_limit_worker: 0,
			queries_per_conn: 0,
			recursion_desired: true,
			probability: 1.0,
			edns_size: 0,
			edns_opt: None,
			dnssec: false,
			write_timeout: std::time::Duration::from_secs(1),
			read_timeout: std::time::Duration::from_secs(3),
			connect_timeout: std::time::Duration::from_secs(1),
			request_timeout: std::time::Duration::from_secs(5),
			separate_connections: false,
			insecure: false,
			request_delay: RequestDelay::None,
			request_log_path: None,
			prometheus: None,
			csv: None,
			seed: None,
		}
	}

	#[test]
	fn test_build_plain_request() {
		let config = test_config();
		let message = build_request("example.com.", RecordType::A, 1234, &config).unwrap();
		assert_eq!(message.id(), 1234);
		assert!(message.recursion_desired());
		assert_eq!(message.queries().len(), 1);
		assert!(message.extensions().is_none());

		// Wire form carries the ID in the first two bytes, big-endian
		let bytes = message.to_vec().unwrap();
		assert_eq!(bytes[0], (1234 >> 8) as u8);
		assert_eq!(bytes[1], (1234 & 0xff) as u8);
	}

	#[test]
	fn test_norecurse_clears_rd() {
		let mut config = test_config();
		config.recursion_desired = false;
		let message = build_request("example.com.", RecordType::A, 1, &config).unwrap();
		assert!(!message.recursion_desired());
	}

	#[test]
	fn test_dnssec_implies_opt_with_default_payload() {
		let mut config = test_config();
		config.dnssec = true;
		config.edns_opt = Some((65001, vec![0xde, 0xad, 0xbe, 0xef]));
		let message = build_request("example.com.", RecordType::A, 1, &config).unwrap();

		// Round-trip through the wire form so the OPT record is exercised
		let parsed = Message::from_vec(&message.to_vec().unwrap()).unwrap();
		let edns = parsed.extensions().as_ref().expect("OPT record missing");
		assert_eq!(edns.max_payload(), 1232);
		assert!(edns.flags().dnssec_ok);
		match edns.option(EdnsCode::Unknown(65001)) {
			Some(EdnsOption::Unknown(65001, data)) => {
				assert_eq!(data, &vec![0xde, 0xad, 0xbe, 0xef]);
			}
			other => panic!("unexpected EDNS option: {:?}", other),
		}
	}

	#[test]
	fn test_explicit_edns_size() {
		let mut config = test_config();
		config.edns_size = 4096;
		let message = build_request("example.com.", RecordType::A, 1, &config).unwrap();
		let edns = message.extensions().as_ref().expect("OPT record missing");
		assert_eq!(edns.max_payload(), 4096);
		assert!(!edns.flags().dnssec_ok);
	}

	#[test]
	fn test_invalid_name_rejected() {
		let config = test_config();
		// 63 octets is the longest legal label
		let long_label = format!("{}.example.com.", "a".repeat(63));
		assert!(build_request(&long_label, RecordType::A, 1, &config).is_ok());
		assert!(build_request("bad name with spaces", RecordType::A, 1, &config).is_err());
	}

	#[test]
	fn test_rcode_str() {
		use hickory_proto::op::ResponseCode;

		let config = test_config();
		let mut message = build_request("example.com.", RecordType::A, 7, &config).unwrap();
		message.set_message_type(MessageType::Response);
		assert!(is_response(&message));
		assert_eq!(message.response_code(), ResponseCode::NoError);
		assert_eq!(rcode_str(&message), format!("{}", ResponseCode::NoError));
	}
}

//! Parses the `Alt-Svc` advertisement header (§6):
//! `<proto>=":<port>"[; v="<versions>"][; p="<probability>"][, <proto>=...]`.
//! Only `h2` and `quic` are recognized; anything else is ignored.

use proxy_session::altsvc::AdvertisedEndpoint;
use proxy_transport::endpoint::{Endpoint, Host, Scheme};

pub struct ParsedAltSvc {
	pub advertised: Vec<AdvertisedEndpoint>,
	pub versions: Vec<u32>,
}

pub fn parse(header: &str, origin_host: &Host) -> ParsedAltSvc {
	let mut advertised = Vec::new();
	let mut versions = Vec::new();

	for entry in header.split(',') {
		let mut segments = entry.split(';').map(str::trim);
		let Some(proto_and_port) = segments.next() else { continue };
		let Some((proto, quoted_port)) = proto_and_port.split_once('=') else { continue };
		let proto = proto.trim();
		let scheme = match proto {
			"h2" => Scheme::H2,
			"quic" => Scheme::Quic,
			_ => continue,
		};
		let Some(port) = quoted_port.trim().trim_matches('"').strip_prefix(':').and_then(|p| p.parse::<u16>().ok()) else {
			continue;
		};

		let mut entry_versions = vec![1u32];
		for attr in segments {
			if let Some(v) = attr.strip_prefix("v=") {
				entry_versions = v
					.trim_matches('"')
					.split(',')
					.filter_map(|s| s.trim().parse::<u32>().ok())
					.collect();
			}
		}
		versions.extend(entry_versions.iter().copied());
		advertised.push(AdvertisedEndpoint {
			endpoint: Endpoint::new(scheme, origin_host.clone(), port),
			protocol_version: *entry_versions.first().unwrap_or(&1),
		});
	}

	versions.sort_unstable();
	versions.dedup();
	ParsedAltSvc { advertised, versions }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_h2_and_quic_entries() {
		let result = parse(r#"h2=":443", quic=":443"; v="1,2""#, &Host::Name("example.com".into()));
		assert_eq!(result.advertised.len(), 2);
		assert_eq!(result.advertised[1].endpoint.scheme, Scheme::Quic);
	}

	#[test]
	fn ignores_unrecognized_protocols() {
		let result = parse(r#"h3=":443""#, &Host::Name("example.com".into()));
		assert!(result.advertised.is_empty());
	}

	#[test]
	fn skips_malformed_entries_without_failing_the_whole_header() {
		let result = parse(r#"garbage, h2=":443""#, &Host::Name("example.com".into()));
		assert_eq!(result.advertised.len(), 1);
	}
}

use std::{collections::HashMap, net::IpAddr};

use crate::{ClientKey, DEFAULT_TRUSTED_HEADERS};

fn trusted() -> Vec<String> {
    DEFAULT_TRUSTED_HEADERS
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn peer() -> IpAddr {
    "198.51.100.20".parse().unwrap()
}

fn resolve(headers: &[(&str, &str)]) -> ClientKey {
    let headers: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect();

    ClientKey::resolve(
        |name| headers.get(&name.to_ascii_lowercase()).map(String::as_str),
        &trusted(),
        peer(),
    )
}

#[test]
fn ipv4_is_used_verbatim() {
    let key = ClientKey::from_ip("203.0.113.7".parse().unwrap());

    assert_eq!(&*key, "203.0.113.7");
    assert!(!key.is_ipv6());
}

#[test]
fn ipv6_is_grouped_to_its_64_prefix() {
    let a = ClientKey::from_ip("2001:db8:1:2:aaaa:bbbb:cccc:dddd".parse().unwrap());
    let b = ClientKey::from_ip("2001:db8:1:2::1".parse().unwrap());
    let other = ClientKey::from_ip("2001:db8:1:3::1".parse().unwrap());

    assert_eq!(a.to_string(), "2001:db8:1:2::");
    assert_eq!(a, b);
    assert_ne!(a, other);
    assert!(a.is_ipv6());
}

#[test]
fn ipv4_mapped_ipv6_is_treated_as_ipv4() {
    let key = ClientKey::from_ip("::ffff:203.0.113.7".parse().unwrap());

    assert_eq!(&*key, "203.0.113.7");
    assert!(!key.is_ipv6());
}

#[test]
fn falls_back_to_peer_without_headers() {
    assert_eq!(&*resolve(&[]), "198.51.100.20");
}

#[test]
fn trusted_headers_are_tried_in_order() {
    let key = resolve(&[
        ("X-Forwarded-For", "203.0.113.9"),
        ("CF-Connecting-IP", "203.0.113.1"),
    ]);

    assert_eq!(&*key, "203.0.113.1");
}

#[test]
fn forwarded_for_uses_first_entry() {
    let key = resolve(&[("X-Forwarded-For", "203.0.113.9, 10.0.0.1, 10.0.0.2")]);

    assert_eq!(&*key, "203.0.113.9");
}

#[test]
fn private_and_garbage_header_values_are_skipped() {
    assert_eq!(
        &*resolve(&[("CF-Connecting-IP", "10.1.2.3")]),
        "198.51.100.20"
    );
    assert_eq!(
        &*resolve(&[("CF-Connecting-IP", "garbage"), ("X-Forwarded-For", "203.0.113.5")]),
        "203.0.113.5"
    );
    assert_eq!(
        &*resolve(&[("X-Forwarded-For", "127.0.0.1")]),
        "198.51.100.20"
    );
}

#[test]
fn untrusted_headers_are_ignored() {
    let headers = [("CF-Connecting-IP", "203.0.113.1")];
    let key = ClientKey::resolve(
        |name| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| *v)
        },
        &[],
        peer(),
    );

    assert_eq!(&*key, "198.51.100.20");
}

#[test]
fn forwarded_ipv6_is_grouped() {
    let key = resolve(&[("CF-Connecting-IP", "2001:db8::dead:beef")]);

    assert_eq!(&*key, "2001:db8::");
    assert!(key.is_ipv6());
}

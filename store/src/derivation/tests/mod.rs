use std::collections::BTreeSet;

use lazy_static::lazy_static;
use pretty_assertions::assert_eq;

use crate::ca::{ContentAddress, ContentAddressMethod};
use crate::derivation::{
    hash_placeholder, Derivation, Output, OutputRef, DEFAULT_OUTPUT_NAME,
};
use crate::hash::{sha256_sum, HashAlgo};
use crate::store_path::{Directory, StorePath};

lazy_static! {
    static ref DIR: Directory = Directory::clean("/zb/store").unwrap();
}

/// A floating-output derivation that writes a greeting.
fn hello_floating() -> Derivation {
    let mut drv = Derivation::new(DIR.clone(), "hello");
    drv.system = "x86_64-linux".to_string();
    drv.builder = "/bin/sh".to_string();
    drv.args = vec!["-c".to_string(), "echo 'Hello' > $out".to_string()];
    drv.outputs
        .insert(DEFAULT_OUTPUT_NAME.to_string(), Output::floating_default());
    drv.env
        .insert("builder".to_string(), "/bin/sh".to_string());
    drv.env.insert("name".to_string(), "hello".to_string());
    drv.env.insert(
        DEFAULT_OUTPUT_NAME.to_string(),
        hash_placeholder(DEFAULT_OUTPUT_NAME),
    );
    drv.env
        .insert("system".to_string(), "x86_64-linux".to_string());
    drv
}

/// A fixed-output derivation: flat sha256 of "Hello, World!\n".
fn hello_fixed() -> Derivation {
    let ca = ContentAddress::Flat(sha256_sum(b"Hello, World!\n"));
    let mut drv = Derivation::new(DIR.clone(), "hello");
    drv.system = "x86_64-linux".to_string();
    drv.builder = "/bin/sh".to_string();
    drv.args = vec![
        "-c".to_string(),
        "echo 'Hello, World!' > $out".to_string(),
    ];
    drv.outputs
        .insert(DEFAULT_OUTPUT_NAME.to_string(), Output::Fixed(ca));

    let out_path = drv
        .fixed_output_path(DEFAULT_OUTPUT_NAME)
        .expect("out exists")
        .expect("path computes");
    drv.env
        .insert(DEFAULT_OUTPUT_NAME.to_string(), out_path.to_string());
    drv
}

#[test]
fn floating_marshal_golden() {
    let drv = hello_floating();
    drv.validate().expect("must validate");

    let aterm = drv.to_aterm_bytes().expect("must marshal");
    assert_eq!(
        String::from_utf8(aterm).unwrap(),
        r#"Derive([("out","","r:sha256","")],[],[],"x86_64-linux","/bin/sh",["-c","echo 'Hello' > $out"],[("builder","/bin/sh"),("name","hello"),("out","/1rz4g4znpzjwh1xymhjpm42vipw92pr73vdgl6xs1hycac8kf2n9"),("system","x86_64-linux")])"#,
    );

    assert_eq!(
        drv.store_path().expect("must compute").as_str(),
        "/zb/store/wiz78jqswvw1sy2frx3538grjlqnmkil-hello.drv"
    );
}

#[test]
fn fixed_marshal_golden() {
    let drv = hello_fixed();
    drv.validate().expect("must validate");

    assert_eq!(
        drv.fixed_output_path("out").unwrap().unwrap().as_str(),
        "/zb/store/mg46pc49vbbbgywkis4qw0dkdmrs51b2-hello"
    );

    let aterm = drv.to_aterm_bytes().expect("must marshal");
    assert_eq!(
        String::from_utf8(aterm).unwrap(),
        r#"Derive([("out","/zb/store/mg46pc49vbbbgywkis4qw0dkdmrs51b2-hello","sha256","c98c24b677eff44860afea6f493bbaec5bb1c4cbb209c6fc2bbb47f66ff2ad31")],[],[],"x86_64-linux","/bin/sh",["-c","echo 'Hello, World!' > $out"],[("out","/zb/store/mg46pc49vbbbgywkis4qw0dkdmrs51b2-hello")])"#,
    );

    assert_eq!(
        drv.store_path().expect("must compute").as_str(),
        "/zb/store/g7z97wbj3kd3glakafypli36i5anh1sa-hello.drv"
    );
}

#[test]
fn aterm_round_trip() {
    for drv in [hello_floating(), hello_fixed(), with_inputs()] {
        let aterm = drv.to_aterm_bytes().expect("must marshal");
        let parsed =
            Derivation::parse(&DIR, &drv.name, &aterm).expect("must parse");
        assert_eq!(parsed, drv);
    }
}

fn with_inputs() -> Derivation {
    let mut drv = Derivation::new(DIR.clone(), "withdeps");
    drv.system = "x86_64-linux".to_string();
    drv.builder = "/bin/sh".to_string();
    drv.outputs
        .insert(DEFAULT_OUTPUT_NAME.to_string(), Output::floating_default());
    drv.env.insert(
        DEFAULT_OUTPUT_NAME.to_string(),
        hash_placeholder(DEFAULT_OUTPUT_NAME),
    );
    drv.input_sources.insert(
        StorePath::parse("/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-src").unwrap(),
    );
    drv.input_derivations.insert(
        StorePath::parse("/zb/store/xp46jjlpnbvqzyqvcwpxlbdzlmzqc12c-dep.drv").unwrap(),
        ["dev".to_string(), "out".to_string()].into_iter().collect(),
    );
    drv
}

#[test]
fn inputs_become_references() {
    let drv = with_inputs();
    drv.validate().expect("must validate");

    assert_eq!(
        drv.store_path().expect("must compute").as_str(),
        "/zb/store/az5sig7gpzwnj82dkwf07yipkwwqd2ip-withdeps.drv"
    );

    let exported = drv.export(HashAlgo::Sha256).expect("must export");
    let refs: BTreeSet<String> = exported
        .trailer
        .references
        .iter()
        .map(|p| p.to_string())
        .collect();
    assert_eq!(
        refs,
        BTreeSet::from([
            "/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-src".to_string(),
            "/zb/store/xp46jjlpnbvqzyqvcwpxlbdzlmzqc12c-dep.drv".to_string(),
        ])
    );
    assert_eq!(exported.trailer.store_path, drv.store_path().unwrap());
    assert!(matches!(
        exported.trailer.content_address,
        Some(ContentAddress::Text(_))
    ));
    assert_eq!(exported.nar_hash.algo(), HashAlgo::Sha256);

    // the exported NAR is a single regular file holding the ATerm
    let mut rd = &exported.nar[..];
    match crate::nar::reader::open(&mut rd).expect("valid NAR") {
        crate::nar::reader::Node::File {
            executable,
            mut reader,
        } => {
            assert!(!executable);
            let mut contents = Vec::new();
            std::io::Read::read_to_end(&mut reader, &mut contents).unwrap();
            assert_eq!(contents, drv.to_aterm_bytes().unwrap());
        }
        _ => panic!("expected a regular file"),
    }
}

#[test]
fn parse_rejects_mismatched_fixed_path() {
    let drv = hello_fixed();
    let aterm = String::from_utf8(drv.to_aterm_bytes().unwrap()).unwrap();
    let broken = aterm.replace(
        "mg46pc49vbbbgywkis4qw0dkdmrs51b2",
        "00000000000000000000000000000000",
    );
    Derivation::parse(&DIR, "hello", broken.as_bytes()).expect_err("must fail");
}

#[test]
fn parse_rejects_garbage() {
    Derivation::parse(&DIR, "x", b"Derive(42)").expect_err("must fail");
    Derivation::parse(&DIR, "x", b"NotADerivation([])").expect_err("must fail");
    Derivation::parse(&DIR, "x", b"").expect_err("must fail");
}

#[test]
fn validate_rejects() {
    // no outputs
    let mut drv = hello_floating();
    drv.outputs.clear();
    drv.validate().expect_err("no outputs");

    // fixed output must be sole and named "out"
    let mut drv = hello_fixed();
    drv.outputs
        .insert("dev".to_string(), Output::floating_default());
    drv.validate().expect_err("fixed plus extra output");

    // output names may not contain the reference separators
    let mut drv = hello_floating();
    drv.outputs
        .insert("a!b".to_string(), Output::floating_default());
    drv.validate().expect_err("bad output name");

    // inputs must live in the same store directory
    let mut drv = hello_floating();
    drv.input_sources.insert(
        StorePath::parse("/elsewhere/00bgd045z0d4icpbc2yyz4gx48ak44la-src").unwrap(),
    );
    drv.validate().expect_err("foreign input source");

    // input derivations must be .drv paths
    let mut drv = hello_floating();
    drv.input_derivations.insert(
        StorePath::parse("/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-src").unwrap(),
        BTreeSet::from(["out".to_string()]),
    );
    drv.validate().expect_err("non-drv input derivation");

    // floating text outputs don't exist
    let mut drv = hello_floating();
    drv.outputs.insert(
        DEFAULT_OUTPUT_NAME.to_string(),
        Output::Floating {
            method: ContentAddressMethod::Text,
            algo: HashAlgo::Sha256,
        },
    );
    drv.validate().expect_err("text floating output");
}

#[test]
fn output_ref_round_trip() {
    let r = OutputRef::new(
        StorePath::parse("/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-hello.drv").unwrap(),
        "out",
    );
    assert_eq!(
        r.to_string(),
        "/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-hello.drv!out"
    );
    let parsed: OutputRef = r.to_string().parse().unwrap();
    assert_eq!(parsed, r);
}

#[test]
fn derivation_name_detection() {
    let drv = hello_floating();
    let path = drv.store_path().unwrap();
    assert!(path.is_derivation());
    assert_eq!(path.derivation_name(), Some("hello"));
}

//! Placeholder strings standing in for output paths whose final value
//! is unknown until realization.

use sha2::{Digest, Sha256};

use crate::nixbase32;

use super::{OutputRef, DEFAULT_OUTPUT_NAME};

/// The placeholder for a floating output of the derivation currently
/// being built: it appears in the builder's environment and is replaced
/// with the actual output path at build time.
pub fn hash_placeholder(output_name: &str) -> String {
    let digest = Sha256::digest(format!("nix-output:{}", output_name).as_bytes());
    format!("/{}", nixbase32::encode(&digest))
}

/// The placeholder for a content-addressed output of *another*
/// derivation, used by consumers that depend on that output's future
/// path.
pub fn unknown_ca_output_placeholder(output: &OutputRef) -> String {
    let drv_name = output
        .drv
        .derivation_name()
        .unwrap_or_else(|| output.drv.name());

    let mut preimage = format!(
        "nix-upstream-output:{}:{}",
        output.drv.digest(),
        drv_name
    );
    if output.output != DEFAULT_OUTPUT_NAME {
        preimage.push('-');
        preimage.push_str(&output.output);
    }

    let digest = Sha256::digest(preimage.as_bytes());
    format!("/{}", nixbase32::encode(&digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_path::StorePath;

    #[test]
    fn hash_placeholder_form() {
        let p = hash_placeholder("out");
        // `/` plus a 52-character nixbase32 rendering of a 32-byte
        // digest
        assert_eq!(p.len(), 53);
        assert!(p.starts_with('/'));
        assert!(p
            .bytes()
            .skip(1)
            .all(crate::nixbase32::is_alphabet_char));

        // matches the value Nix computes for `builtins.placeholder
        // "out"`
        assert_eq!(
            p,
            "/1rz4g4znpzjwh1xymhjpm42vipw92pr73vdgl6xs1hycac8kf2n9"
        );

        assert_ne!(hash_placeholder("out"), hash_placeholder("dev"));
    }

    #[test]
    fn unknown_ca_output_placeholder_form() {
        let drv = StorePath::parse(
            "/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-hello.drv",
        )
        .unwrap();

        let out = unknown_ca_output_placeholder(&OutputRef::new(drv.clone(), "out"));
        let dev = unknown_ca_output_placeholder(&OutputRef::new(drv, "dev"));
        assert_eq!(out.len(), 53);
        assert!(out.starts_with('/'));
        assert_ne!(out, dev);

        // the default output omits the name suffix from the pre-image
        let preimage = "nix-upstream-output:00bgd045z0d4icpbc2yyz4gx48ak44la:hello";
        let digest = sha2::Sha256::digest(preimage.as_bytes());
        assert_eq!(out, format!("/{}", crate::nixbase32::encode(&digest)));
    }
}

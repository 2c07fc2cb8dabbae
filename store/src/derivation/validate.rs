use crate::ca::ContentAddressMethod;

use super::{Derivation, DerivationError, Output, DEFAULT_OUTPUT_NAME};

/// Reports whether `name` may name a derivation output.
/// `^` and `!` are reserved as output separators in references.
fn valid_output_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['^', '!'])
}

impl Derivation {
    /// Ensures the derivation is properly populated, returning a
    /// [DerivationError] if not.
    pub fn validate(&self) -> Result<(), DerivationError> {
        if self.outputs.is_empty() {
            return Err(DerivationError::NoOutputs);
        }

        for (output_name, output) in &self.outputs {
            if !valid_output_name(output_name) {
                return Err(DerivationError::InvalidOutputName(output_name.clone()));
            }

            match output {
                Output::Fixed(_) => {
                    // fixed-output derivations have exactly one output,
                    // and it is the default one
                    if self.outputs.len() != 1 || output_name != DEFAULT_OUTPUT_NAME {
                        return Err(DerivationError::InvalidFixedOutputs);
                    }
                }
                Output::Floating { method, .. } => {
                    if *method == ContentAddressMethod::Text {
                        return Err(DerivationError::TextFloatingOutput(output_name.clone()));
                    }
                }
            }
        }

        for (drv_path, output_names) in &self.input_derivations {
            if !drv_path.is_derivation() {
                return Err(DerivationError::InvalidInputDerivation(
                    drv_path.to_string(),
                ));
            }
            if drv_path.directory() != self.dir {
                return Err(DerivationError::InputOutsideStore(drv_path.to_string()));
            }
            if output_names.is_empty() {
                return Err(DerivationError::InvalidInputDerivationOutput {
                    drv: drv_path.to_string(),
                    output: String::new(),
                });
            }
            for output_name in output_names {
                if !valid_output_name(output_name) {
                    return Err(DerivationError::InvalidInputDerivationOutput {
                        drv: drv_path.to_string(),
                        output: output_name.clone(),
                    });
                }
            }
        }

        for input_source in &self.input_sources {
            if input_source.directory() != self.dir {
                return Err(DerivationError::InputOutsideStore(
                    input_source.to_string(),
                ));
            }
        }

        if self.system.is_empty() {
            return Err(DerivationError::EmptySystem);
        }
        if self.builder.is_empty() {
            return Err(DerivationError::EmptyBuilder);
        }
        for k in self.env.keys() {
            if k.is_empty() {
                return Err(DerivationError::EmptyEnvironmentKey);
            }
        }

        Ok(())
    }
}

use crate::error::{Result, StemError};

/// Known model names and the manifests that describe them.
const REGISTRY: &[(&str, &str)] = &[(
    "htdemucs_ort_v1",
    "https://huggingface.co/gentij/htdemucs-ort/resolve/main/manifest.json",
)];

pub fn resolve_manifest_url(name: &str) -> Result<String> {
    REGISTRY
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, url)| url.to_string())
        .ok_or_else(|| StemError::Manifest(format!("unknown model '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_names() {
        assert!(resolve_manifest_url("htdemucs_ort_v1")
            .unwrap()
            .ends_with("manifest.json"));
        assert!(resolve_manifest_url("HTDEMUCS_ORT_V1").is_ok());
        assert!(matches!(
            resolve_manifest_url("nope"),
            Err(StemError::Manifest(_))
        ));
    }
}

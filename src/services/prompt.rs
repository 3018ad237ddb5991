use crate::models::descriptor::JobDescriptor;

/// Scene phrases for the template keys the batch files commonly use.
/// Unknown keys are passed through verbatim as the scene description.
const SCENES: &[(&str, &str)] = &[
    ("minimal", "clean minimal background that keeps the focus on the product"),
    ("cafe", "modern Thai cafe with tropical plants and soft natural light"),
    ("street", "urban street at golden hour"),
    ("studio", "modern photo studio with softbox lighting"),
    ("outdoor", "outdoor natural setting with greenery and daylight"),
    ("home", "cozy home interior with warm ambient light"),
    ("mall", "bright shopping mall concourse"),
];

/// Build the generation prompt for a descriptor.
///
/// The product in the reference image must be preserved exactly; the scene and
/// quality wording come from `template_key` and `quality_preset`.
pub fn compose(descriptor: &JobDescriptor) -> String {
    let key = descriptor.template_key.trim();
    let scene = SCENES
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, phrase)| *phrase)
        .unwrap_or(key);

    format!(
        "{quality} lifestyle photograph featuring the {product} from the reference image, \
         set in a {scene}. Keep the product identical to the reference: same color, shape, \
         logo and texture. Realistic candid photography, vertical 9:16 composition.",
        quality = quality_phrase(&descriptor.quality_preset),
        product = descriptor.product_type.trim(),
        scene = scene,
    )
}

fn quality_phrase(preset: &str) -> &str {
    match preset.trim().to_ascii_lowercase().as_str() {
        "hd" | "high" => "High-detail professional",
        "draft" | "fast" => "Simple",
        _ => "Natural",
    }
}

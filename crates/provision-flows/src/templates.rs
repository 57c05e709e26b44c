//! Shell and manifest snippets rendered with minijinja.

use minijinja::{Environment, context};
use provision_state_machine::{CommandError, CommandResultExt};

/// Decompress a streamed partition image onto a block device, reporting
/// which stage of the pipe failed.
const PARTITION_INSTALL: &str = r#"gzip -d | dd of={{ output }} obs=2M
pipestatus=("${PIPESTATUS[@]}")
if [[ "${pipestatus[0]}" -ne 0 ]]; then
  echo "$(date --rfc-3339=seconds) ERROR: Fetching {{ source }} failed." >&2
  exit 1
elif [[ "${pipestatus[1]}" -ne 0 ]]; then
  echo "$(date --rfc-3339=seconds) ERROR: Decompressing {{ source }} failed." >&2
  exit 1
elif [[ "${pipestatus[2]}" -ne 0 ]]; then
  echo "$(date --rfc-3339=seconds) ERROR: Writing to {{ output }} failed." >&2
  exit 1
fi"#;

/// imageloader manifest for a LaCrOS component.
const IMAGELOADER_MANIFEST: &str = r#"{
  "manifest-version": 1,
  "fs-type": "squashfs",
  "version": "{{ version }}",
  "image-sha256-hash": "{{ image_hash }}",
  "table-sha256-hash": "{{ table_hash }}"
}"#;

/// Component manifest read by the browser's component updater.
const COMPONENT_MANIFEST: &str = r#"{
  "manifest-version": 2,
  "name": "lacros",
  "version": "{{ version }}",
  "imageName": "image.squash",
  "squash": true,
  "fsType": "squashfs",
  "isRemovable": false
}"#;

fn render(name: &str, template: &str, ctx: minijinja::Value) -> Result<String, CommandError> {
  Environment::new()
    .render_str(template, ctx)
    .command_context(format!("failed to render {}", name))
}

pub fn partition_install(source: &str, output: &str) -> Result<String, CommandError> {
  render(
    "partition install script",
    PARTITION_INSTALL,
    context! { source => source, output => output },
  )
}

pub fn imageloader_manifest(
  version: &str,
  image_hash: &str,
  table_hash: &str,
) -> Result<String, CommandError> {
  render(
    "imageloader manifest",
    IMAGELOADER_MANIFEST,
    context! { version => version, image_hash => image_hash, table_hash => table_hash },
  )
}

pub fn component_manifest(version: &str) -> Result<String, CommandError> {
  render(
    "component manifest",
    COMPONENT_MANIFEST,
    context! { version => version },
  )
}

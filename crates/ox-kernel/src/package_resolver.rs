//! Title update discovery
//!
//! Installed title updates are installer packages holding `<module>p`
//! delta patches, either at the package root or under a `discNNN` folder
//! for multi-disc titles. Resolution mounts the first applicable package
//! at `update:`.

use crate::content::CONTENT_TYPE_INSTALLER;
use crate::kernel_state::KernelState;
use crate::user_module::UserModule;
use ox_loader::XexModule;
use tracing::{debug, error, warn};

/// Root name update packages are bound to
pub const UPDATE_ROOT: &str = "update";

fn update_link() -> String {
    format!("{}:", UPDATE_ROOT)
}

/// Mount the first installed update package holding a patch applicable to
/// `base`. Any earlier `update:` binding is closed first so at most one
/// package stays bound. Returns whether a package was mounted.
pub fn try_mount_update_package(kernel: &KernelState, base: &UserModule, module_path: &str) -> bool {
    let content = kernel.content_manager();
    let vfs = kernel.file_system();

    if content.is_open(UPDATE_ROOT) {
        debug!("Closing previously mounted update package");
        if let Err(e) = content.close_content(UPDATE_ROOT) {
            warn!("Failed to close {}: {}", update_link(), e);
        }
    }

    let Some(title_id) = kernel.title_id() else {
        return false;
    };

    // Prefer the running executable: a DLL being patched may carry no
    // execution info of its own
    let disc_number = kernel
        .executable_module()
        .and_then(|exe| exe.execution_info())
        .or_else(|| base.execution_info())
        .map(|info| info.disc_number)
        .unwrap_or(0);

    for package in content.list_content(title_id, CONTENT_TYPE_INSTALLER) {
        debug!("Checking if TU {} is applicable...", package.file_name);
        if let Err(e) = content.open_content(UPDATE_ROOT, title_id, &package) {
            error!("Failed to open TU package {}: {}", package.file_name, e);
            continue;
        }

        let disc_root = format!("disc{:03}", disc_number);
        let candidates = [
            (format!("{}\\{}\\{}p", update_link(), disc_root, module_path), true),
            (format!("{}\\{}p", update_link(), module_path), false),
        ];
        let found = candidates
            .into_iter()
            .find_map(|(path, in_disc_root)| vfs.resolve_path(&path).map(|f| (f, in_disc_root)));

        let Some((patch_file, in_disc_root)) = found else {
            warn!("Failed to locate {}p inside TU package", module_path);
            close_update(kernel);
            continue;
        };

        let data = match patch_file.read_all() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to read {}p inside TU package: {}", module_path, e);
                close_update(kernel);
                continue;
            }
        };

        // Headers are all applicability needs
        let patch = match XexModule::load(
            &format!("{}p", module_path),
            &patch_file.absolute_path(),
            &data,
            0,
            kernel.crypto(),
        ) {
            Ok(patch) => patch,
            Err(e) => {
                error!("Failed to load {}p module: {}", module_path, e);
                close_update(kernel);
                continue;
            }
        };

        let applicable = base
            .with_xex(|base| patch.is_patch_applicable(base))
            .unwrap_or(false);
        if !applicable {
            debug!("TU {}p isn't applicable to the loaded XEX", module_path);
            close_update(kernel);
            continue;
        }

        if in_disc_root {
            let remapped = vfs
                .find_symbolic_link(&update_link())
                .is_some_and(|target| {
                    vfs.update_symbolic_link(&update_link(), &format!("{}\\{}", target, disc_root))
                });
            if !remapped {
                error!("Failed to remap {}\\ to new root {}", update_link(), disc_root);
            }
        }

        debug!("TU package {} is applicable", package.file_name);
        return true;
    }
    false
}

fn close_update(kernel: &KernelState) {
    if let Err(e) = kernel.content_manager().close_content(UPDATE_ROOT) {
        warn!("Failed to close {}: {}", update_link(), e);
    }
}

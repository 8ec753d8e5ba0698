//! Device registry: joins the inventory with the bridge configuration.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::config::ConfigError;
use crate::config::DeviceSection;
use crate::config::InventoryEntry;
use crate::config::ValidationError;
use crate::device::Credential;
use crate::device::Device;
use crate::entity::Entity;
use crate::entity::EntityKind;

const DEFAULT_MANUFACTURER: &str = "Tuya";
const DEFAULT_MODEL: &str = "Generic";

/// Build the device list from a loaded configuration and inventory.
///
/// Every `[device.<id>]` section must name an inventory device. Inventory
/// devices without a section are not bridged. Devices are returned sorted
/// by id.
pub fn build(
    config: &Config,
    config_path: &Path,
    inventory: Vec<InventoryEntry>,
    inventory_path: &Path,
) -> Result<Vec<Device>, ConfigError> {
    let mut by_id: BTreeMap<String, InventoryEntry> = BTreeMap::new();
    for entry in inventory {
        if by_id.contains_key(&entry.id) {
            tracing::warn!("Device {} listed twice in inventory, using the last entry", entry.id);
        }
        by_id.insert(entry.id.clone(), entry);
    }

    let mut devices = Vec::with_capacity(config.devices.len());
    for (id, section) in &config.devices {
        let Some(entry) = by_id.remove(id) else {
            return Err(ConfigError::UnknownDevice {
                id: id.clone(),
                path: config_path.to_path_buf(),
                inventory: inventory_path.to_path_buf(),
            });
        };

        let entities =
            validate_section(id, section).map_err(|errors| ConfigError::InvalidSection {
                path: config_path.to_path_buf(),
                section: format!("device.{}", id),
                errors,
            })?;

        let manufacturer = section
            .manufacturer
            .clone()
            .or_else(|| section.preset.map(|p| p.manufacturer().to_string()))
            .unwrap_or_else(|| DEFAULT_MANUFACTURER.to_string());
        let model = section
            .model
            .clone()
            .or_else(|| section.preset.map(|p| p.model().to_string()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        devices.push(Device {
            id: entry.id,
            name: entry.name,
            mac: entry.mac,
            address: entry.ip,
            key: Credential::new(entry.key),
            version: entry
                .version
                .unwrap_or_else(|| config.transport.protocol_version.clone()),
            manufacturer,
            model,
            entities,
        });
    }

    for (id, entry) in by_id {
        tracing::info!("Skipping device {} ({}): no [device.{}] section", id, entry.name, id);
    }

    Ok(devices)
}

/// Validate one `[device.<id>]` section into its entity list
fn validate_section(
    id: &str,
    section: &DeviceSection,
) -> Result<Vec<Entity>, Vec<ValidationError>> {
    let section_path = format!("device.{}", id);
    let mut errors = Vec::new();

    let configs = match section.preset {
        Some(_) if !section.entities.is_empty() => {
            errors.push(ValidationError {
                field_path: format!("{}.preset", section_path),
                message: "cannot be combined with an explicit entity list".to_string(),
            });
            return Err(errors);
        }
        Some(preset) => preset.entities(),
        None => section.entities.clone(),
    };

    let mut entities = Vec::with_capacity(configs.len());
    let mut kinds: BTreeMap<EntityKind, usize> = BTreeMap::new();
    let mut addresses = BTreeMap::new();

    for (i, config) in configs.iter().enumerate() {
        let path = format!("{}.entity[{}]", section_path, i);

        if let Some(first) = kinds.insert(config.kind(), i) {
            errors.push(ValidationError {
                field_path: path.clone(),
                message: format!(
                    "duplicate {} entity, already defined by entity[{}]",
                    config.kind(),
                    first
                ),
            });
        }

        match config.validate(&path) {
            Ok(entity) => {
                for address in entity.addresses() {
                    if let Some(other) = addresses.insert(address, i) {
                        errors.push(ValidationError {
                            field_path: path.clone(),
                            message: format!(
                                "address {} already used by entity[{}]",
                                address, other
                            ),
                        });
                    }
                }
                entities.push(entity);
            }
            Err(mut field_errors) => errors.append(&mut field_errors),
        }
    }

    if errors.is_empty() {
        Ok(entities)
    } else {
        Err(errors)
    }
}

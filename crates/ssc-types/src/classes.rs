// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — SemanticKITTI Class Table
// ─────────────────────────────────────────────────────────────────────
//! Class names, default loss weights and the inverse learning map for
//! the 20-class SemanticKITTI completion benchmark.

pub const N_CLASSES: usize = 20;

/// Label reserved for unobserved voxels. Excluded from every loss and metric.
pub const IGNORE_LABEL: u8 = 255;

pub const CLASS_NAMES: [&str; N_CLASSES] = [
    "empty",
    "car",
    "bicycle",
    "motorcycle",
    "truck",
    "other-vehicle",
    "person",
    "bicyclist",
    "motorcyclist",
    "road",
    "parking",
    "sidewalk",
    "other-ground",
    "building",
    "fence",
    "vegetation",
    "trunk",
    "terrain",
    "pole",
    "traffic-sign",
];

/// Per-class weights for the semantic cross-entropy term.
pub const CLASS_WEIGHTS: [f64; N_CLASSES] = [
    0.446, 0.603, 0.852, 0.856, 0.747, 0.734, 0.801, 0.796, 0.818, 0.557, //
    0.653, 0.568, 0.683, 0.560, 0.603, 0.530, 0.688, 0.574, 0.716, 0.786,
];

/// Train id → raw SemanticKITTI label id.
pub const LEARNING_MAP_INV: [u16; N_CLASSES] = [
    0,  // empty / unlabeled
    10, // car
    11, // bicycle
    15, // motorcycle
    18, // truck
    20, // other-vehicle
    30, // person
    31, // bicyclist
    32, // motorcyclist
    40, // road
    44, // parking
    48, // sidewalk
    49, // other-ground
    50, // building
    51, // fence
    70, // vegetation
    71, // trunk
    72, // terrain
    80, // pole
    81, // traffic-sign
];

/// Map a train id to its raw label id. Ids outside the table pass through.
#[inline]
pub fn to_raw_label(train_id: u8) -> u16 {
    LEARNING_MAP_INV
        .get(train_id as usize)
        .copied()
        .unwrap_or(train_id as u16)
}

pub fn class_name(train_id: u8) -> Option<&'static str> {
    CLASS_NAMES.get(train_id as usize).copied()
}

//! COCO class labels used by the bundled detection models

/// The 80 COCO classes in contiguous order (YOLO-style class index)
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
    "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
    "toothbrush",
];

/// Original COCO category ids (1-based, with gaps) that have no class
const UNUSED_COCO_IDS: [u32; 10] = [12, 26, 29, 30, 45, 66, 68, 69, 71, 83];

/// Labels that count as produce in a fruit-stand scene
pub const PRODUCE_LABELS: [&str; 5] = ["banana", "apple", "orange", "broccoli", "carrot"];

/// Label for a contiguous class index
pub fn label_for_index(index: usize) -> Option<&'static str> {
    COCO_LABELS.get(index).copied()
}

/// Label for an original 1-based COCO category id (as emitted by SSD exports)
pub fn label_for_coco_id(id: u32) -> Option<&'static str> {
    if id == 0 || id > 90 || UNUSED_COCO_IDS.contains(&id) {
        return None;
    }
    let skipped = UNUSED_COCO_IDS.iter().filter(|&&unused| unused < id).count() as u32;
    label_for_index((id - 1 - skipped) as usize)
}

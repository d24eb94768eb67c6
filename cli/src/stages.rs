use camino::{Utf8Path, Utf8PathBuf};
use nagare::{Action, CommandTemplate, Graph, GraphError, Outputs, Pipeline, Task, Value};

pub const RECON: &str = "recon";
pub const THICKNESS: &str = "thickness";
pub const MORPHOLOGY: &str = "morphology";

/// Prefix passed to antsCorticalThickness.sh for everything it writes.
const ANTS_PREFIX: &str = "ants";

/// Everything the three stages need to know about a subject.
#[derive(Debug, Clone)]
pub struct Subject {
    /// Absolute path of the T1-weighted image.
    pub data: Utf8PathBuf,
    pub id: String,
    /// Directory holding the OASIS-30 Atropos template files.
    pub template: Utf8PathBuf,
    /// Scratch directory for mindboggle's intermediate files.
    pub working: Utf8PathBuf,
    pub fs_flags: Vec<String>,
    pub ants_flags: Vec<String>,
    pub mb_flags: Vec<String>,
}

fn recon(subject: &Subject) -> Task {
    let command = CommandTemplate::new("recon-all")
        .arg("-all")
        .arg("-i")
        .input("image")
        .arg("-s")
        .arg(&subject.id)
        .arg("-sd")
        .workspace()
        .args(&subject.fs_flags)
        .produces("subject", &subject.id);

    Task::new(RECON, Action::command(command))
        .literal("image", Value::path(&subject.data))
        .output("subject")
}

fn thickness(subject: &Subject) -> Task {
    let template = |file: &str| subject.template.join(file).into_string();

    // Runs inside its workspace, so the relative output prefix lands there.
    let command = CommandTemplate::new("antsCorticalThickness.sh")
        .args(["-d", "3", "-a"])
        .input("image")
        .args(["-o", ANTS_PREFIX])
        .arg("-e")
        .arg(template("T_template0.nii.gz"))
        .arg("-t")
        .arg(template("T_template0_BrainCerebellum.nii.gz"))
        .arg("-m")
        .arg(template("T_template0_BrainCerebellumProbabilityMask.nii.gz"))
        .arg("-f")
        .arg(template("T_template0_BrainCerebellumExtractionMask.nii.gz"))
        .arg("-p")
        .arg(template("Priors2/priors%d.nii.gz"))
        .args(["-u", "0"])
        .args(&subject.ants_flags)
        .produces("segmentation", segmentation(Utf8Path::new("")));

    Task::new(THICKNESS, Action::command(command))
        .literal("image", Value::path(&subject.data))
        .output("segmentation")
}

fn morphology(subject: &Subject) -> Task {
    let command = CommandTemplate::new("mindboggle")
        .input("subject")
        .arg("--out")
        .workspace()
        .arg("--working")
        .arg(subject.working.join("mindboggle").into_string())
        .arg("--ants")
        .input("segmentation")
        .args(&subject.mb_flags)
        .produces("results", &subject.id);

    Task::new(MORPHOLOGY, Action::command(command))
        .input("subject")
        .input("segmentation")
        .output("results")
}

/// Wires recon-all and antsCorticalThickness.sh into mindboggle.
pub fn pipeline(subject: &Subject) -> Result<Pipeline, GraphError> {
    let mut graph = Graph::new();

    graph.add_task(recon(subject))?;
    graph.add_task(thickness(subject))?;
    graph.add_task(morphology(subject))?;

    graph.connect(RECON, "subject", MORPHOLOGY, "subject")?;
    graph.connect(THICKNESS, "segmentation", MORPHOLOGY, "segmentation")?;

    graph.validate()
}

fn segmentation(dir: &Utf8Path) -> Utf8PathBuf {
    dir.join(format!("{ANTS_PREFIX}BrainSegmentation.nii.gz"))
}

/// Outputs standing in for a finished FreeSurfer subject directory.
pub fn recon_outputs(dir: &Utf8Path) -> Outputs {
    Outputs::from([("subject".to_string(), Value::path(dir))])
}

/// Outputs standing in for a finished ANTs output directory.
pub fn thickness_outputs(dir: &Utf8Path) -> Outputs {
    Outputs::from([("segmentation".to_string(), Value::path(segmentation(dir)))])
}

//! The control plane: wires the PHI index, anonymizer engine, ingest
//! pipeline and SCP together for one project, and owns their lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::anonymize::Anonymizer;
use crate::config::ProjectModel;
use crate::error::Result;
use crate::export::{ExportPatientResponse, ExportPatientsRequest, Exporter};
use crate::ingest::IngestPipeline;
use crate::java_index::read_java_index;
use crate::phi_csv::create_phi_csv;
use crate::phi_index::{PhiIndex, MODEL_FILENAME};
use crate::hierarchy::StudyUidHierarchy;
use crate::retrieve::{MoveStudiesRequest, Retriever};
use crate::scp::ScpServer;
use crate::storage::FileStore;

/// A running anonymizer project: local SCP, worker pool, retrieval and
/// export orchestrators around one PHI index.
pub struct ProjectService {
    model: Arc<ProjectModel>,
    index: Arc<PhiIndex>,
    pipeline: IngestPipeline,
    scp: Option<ScpServer>,
    retriever: Retriever,
    exporter: Exporter,
}

impl ProjectService {
    /// Opens the project: loads (or creates) the PHI index snapshot, starts
    /// the anonymizer workers and autosave, and binds the local SCP.
    pub fn open(model: ProjectModel) -> Result<Self> {
        model.validate()?;
        let model = Arc::new(model);
        let store = FileStore::new(&model)?;
        let index = Arc::new(PhiIndex::load_or_new(
            &Self::model_path(&model),
            &model.site_id,
            &model.uid_root,
        )?);
        let anonymizer = Arc::new(Anonymizer::new(&model, Arc::clone(&index), store.clone())?);
        let pipeline = IngestPipeline::start(&model, Arc::clone(&anonymizer));
        let scp = ScpServer::start(&model, pipeline.queue(), Arc::clone(&index))?;
        let retriever = Retriever::new(Arc::clone(&model), Arc::clone(&index), pipeline.queue());
        let exporter = Exporter::new(Arc::clone(&model), store)?;

        info!(project = %model.project_name, site = %model.site_id, "project opened");
        Ok(Self {
            model,
            index,
            pipeline,
            scp: Some(scp),
            retriever,
            exporter,
        })
    }

    fn model_path(model: &ProjectModel) -> PathBuf {
        model.private_dir().join(MODEL_FILENAME)
    }

    pub fn model(&self) -> &ProjectModel {
        &self.model
    }

    pub fn index(&self) -> &Arc<PhiIndex> {
        &self.index
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    pub fn queue_len(&self) -> usize {
        self.pipeline.queue_len()
    }

    /// The address the SCP actually bound (the configured port may be 0).
    pub fn scp_addr(&self) -> Option<String> {
        self.scp.as_ref().map(|scp| scp.local_addr().to_string())
    }

    /// Moves studies from a configured remote into the local SCP.
    pub fn move_studies(&self, request: &MoveStudiesRequest) -> Vec<StudyUidHierarchy> {
        self.retriever.move_studies(request)
    }

    /// Exports patients to a remote SCP or the configured bucket.
    pub fn export_patients(
        &self,
        request: &ExportPatientsRequest,
        events: &crossbeam_channel::Sender<ExportPatientResponse>,
    ) {
        self.exporter.export_patients(request, events)
    }

    /// Seeds the index from a prior Java Anonymizer export workbook.
    pub fn import_java_index(&self, path: &std::path::Path) -> Result<usize> {
        let rows = read_java_index(path)?;
        let count = rows.len();
        self.index.process_java_phi_studies(&rows);
        Ok(count)
    }

    /// Writes the PHI CSV under private/phi_export and returns its path.
    pub fn create_phi_csv(&self) -> Result<PathBuf> {
        create_phi_csv(&self.model, &self.index)
    }

    /// Deterministic shutdown: stop accepting associations, drain and join
    /// the workers, flush the final snapshot.
    pub fn shutdown(mut self) {
        info!("shutting down project service");
        self.retriever.abort_move();
        self.exporter.abort_export();
        if let Some(scp) = self.scp.take() {
            scp.stop();
        }
        self.pipeline.shutdown();
        info!("project service stopped");
    }
}

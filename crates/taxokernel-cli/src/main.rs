use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use taxokernel_api::{
    AddCommentRequest, AddIdentificationRequest, AddTaxonRequest, ApiConfig, CommunityVoteRequest,
    CreateChecklistRequest, CreateObservationRequest, DisagreeRequest, IdentificationEvent,
    ResolveNameRequest, TaxonomyApi,
};
use taxokernel_core::{
    Grade, Lineage, ObservationMetadata, QualityFlags, TaxonRank, TaxonomicStatus, TaxonomyError,
};
use taxokernel_store_sqlite::{
    parse_checklist_id, parse_identification_id, ChecklistFilter, Disagreement, SqliteStore,
};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "TK_LOG";

#[derive(Debug, Parser)]
#[command(name = "tk")]
#[command(about = "Taxokernel CLI")]
struct Cli {
    #[arg(long, default_value = "./taxokernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Taxon {
        #[command(subcommand)]
        command: Box<TaxonCommand>,
    },
    Checklist {
        #[command(subcommand)]
        command: Box<ChecklistCommand>,
    },
    Identification {
        #[command(subcommand)]
        command: Box<IdentificationCommand>,
    },
    Assessment {
        #[command(subcommand)]
        command: Box<AssessmentCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum TaxonCommand {
    Add(TaxonAddArgs),
    Resolve(TaxonResolveArgs),
    DetectRank(DetectRankArgs),
}

#[derive(Debug, Args)]
struct TaxonAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_enum)]
    rank: RankArg,
    #[arg(long, value_enum, default_value = "accepted")]
    status: StatusArg,
    #[arg(long)]
    accepted_name: Option<String>,
    #[arg(long)]
    kingdom: Option<String>,
    #[arg(long)]
    phylum: Option<String>,
    #[arg(long)]
    class: Option<String>,
    #[arg(long)]
    order: Option<String>,
    #[arg(long)]
    family: Option<String>,
    #[arg(long)]
    genus: Option<String>,
    #[arg(long)]
    species: Option<String>,
    #[arg(long)]
    subspecies: Option<String>,
    #[arg(long)]
    variety: Option<String>,
    #[arg(long)]
    form: Option<String>,
}

#[derive(Debug, Args)]
struct TaxonResolveArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_enum)]
    rank: Option<RankArg>,
    #[arg(long)]
    source: Option<String>,
    /// Allow the external name search for this call regardless of configuration.
    #[arg(long, default_value_t = false)]
    search: bool,
}

#[derive(Debug, Args)]
struct DetectRankArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_enum)]
    rank: Option<RankArg>,
}

#[derive(Debug, Subcommand)]
enum ChecklistCommand {
    Create(ChecklistCreateArgs),
    Show(ChecklistRefArgs),
    List(ChecklistListArgs),
    Comment(CommentArgs),
    Comments(ChecklistRefArgs),
}

#[derive(Debug, Args)]
struct ChecklistListArgs {
    #[arg(long)]
    user: Option<String>,
    #[arg(long, value_enum)]
    grade: Option<GradeArg>,
    /// Page size; 0 uses the default of 50, larger values are capped at 100.
    #[arg(long, default_value_t = 0)]
    limit: usize,
}

#[derive(Debug, Args)]
struct CommentArgs {
    #[arg(long)]
    checklist_id: String,
    #[arg(long)]
    user: String,
    #[arg(long)]
    body: String,
}

#[derive(Debug, Args)]
struct ChecklistCreateArgs {
    #[arg(long, conflicts_with = "name", required_unless_present = "name")]
    taxon_id: Option<i64>,
    /// Free-text scientific name, resolved before the checklist is created.
    #[arg(long)]
    name: Option<String>,
    #[arg(long, value_enum)]
    rank: Option<RankArg>,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    user: String,
    #[arg(long, allow_hyphen_values = true)]
    latitude: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    longitude: Option<f64>,
    #[arg(long)]
    observed_on: Option<String>,
    #[arg(long, default_value_t = 0)]
    media_count: u32,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Args)]
struct ChecklistRefArgs {
    #[arg(long)]
    checklist_id: String,
}

#[derive(Debug, Subcommand)]
enum IdentificationCommand {
    Add(IdentificationAddArgs),
    Agree(IdentificationEventArgs),
    Disagree(IdentificationDisagreeArgs),
    Withdraw(IdentificationEventArgs),
    CancelAgreement(IdentificationEventArgs),
}

#[derive(Debug, Args)]
struct IdentificationAddArgs {
    #[arg(long)]
    checklist_id: String,
    #[arg(long)]
    user: String,
    #[arg(long)]
    taxon_id: i64,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Args)]
struct IdentificationEventArgs {
    #[arg(long)]
    checklist_id: String,
    #[arg(long)]
    identification_id: String,
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
struct IdentificationDisagreeArgs {
    #[command(flatten)]
    event: IdentificationEventArgs,
    #[arg(long)]
    taxon_id: Option<i64>,
    #[arg(long, value_enum)]
    level: Option<RankArg>,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Subcommand)]
enum AssessmentCommand {
    Show(ChecklistRefArgs),
    VerifyLocation(VoteArgs),
    VoteWild(VoteArgs),
    Improvement(ImprovementArgs),
    Evaluate(EvaluateArgs),
}

#[derive(Debug, Args)]
struct VoteArgs {
    #[arg(long)]
    checklist_id: String,
    #[arg(long)]
    user: String,
    #[arg(long, action = ArgAction::Set)]
    verdict: bool,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Args)]
struct ImprovementArgs {
    #[arg(long)]
    checklist_id: String,
    #[arg(long, action = ArgAction::Set)]
    can_be_improved: bool,
}

#[derive(Debug, Args)]
struct EvaluateArgs {
    #[arg(long)]
    agreement_count: u32,
    #[arg(long)]
    total_identifications: u32,
    /// Quality flags to treat as unset; all others are set.
    #[arg(long = "missing", value_enum)]
    missing: Vec<FlagArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RankArg {
    Kingdom,
    Phylum,
    Subphylum,
    Class,
    Subclass,
    Order,
    Family,
    Genus,
    Species,
    Subspecies,
    Variety,
    Form,
    Unknown,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GradeArg {
    ResearchGrade,
    LowQualityId,
    NeedsId,
    Casual,
}

impl GradeArg {
    fn into_grade(self) -> Grade {
        match self {
            Self::ResearchGrade => Grade::ResearchGrade,
            Self::LowQualityId => Grade::LowQualityId,
            Self::NeedsId => Grade::NeedsId,
            Self::Casual => Grade::Casual,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Accepted,
    Synonym,
    Unknown,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FlagArg {
    HasDate,
    HasLocation,
    HasMedia,
    IsWild,
    LocationAccurate,
    RecentEvidence,
    RelatedEvidence,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Taxon { command } => run_taxon(*command, &cli.db),
        Command::Checklist { command } => run_checklist(*command, &open_api(&cli.db)?),
        Command::Identification { command } => {
            run_identification(*command, &open_api(&cli.db)?)
        }
        Command::Assessment { command } => run_assessment(*command, &open_api(&cli.db)?),
    }
}

fn open_api(db: &std::path::Path) -> Result<TaxonomyApi> {
    TaxonomyApi::new(db.to_path_buf(), ApiConfig::from_env())
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => {
            store.migrate()?;
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_taxon(command: TaxonCommand, db: &std::path::Path) -> Result<()> {
    match command {
        TaxonCommand::Add(args) => {
            let api = open_api(db)?;
            let taxon = api.add_taxon(AddTaxonRequest {
                scientific_name: args.name,
                taxon_rank: args.rank.into_rank(),
                taxonomic_status: args.status.into_status(),
                accepted_scientific_name: args.accepted_name,
                lineage: Lineage {
                    kingdom: args.kingdom,
                    phylum: args.phylum,
                    class: args.class,
                    order: args.order,
                    family: args.family,
                    genus: args.genus,
                    species: args.species,
                    subspecies: args.subspecies,
                    variety: args.variety,
                    form: args.form,
                },
            })?;
            emit_json(serde_json::to_value(&taxon).context("failed to serialize taxon")?)
        }
        TaxonCommand::Resolve(args) => {
            let mut config = ApiConfig::from_env();
            config.search_enabled |= args.search;
            let api = TaxonomyApi::new(db.to_path_buf(), config)?;
            let resolution = api
                .resolve(ResolveNameRequest {
                    name: args.name,
                    requested_rank: args.rank.map(RankArg::into_rank),
                    source: args.source,
                })
                .map_err(describe_taxonomy_error)?;
            emit_json(serde_json::to_value(&resolution).context("failed to serialize resolution")?)
        }
        TaxonCommand::DetectRank(args) => {
            let api = open_api(db)?;
            let inferred = api.detect_rank(&args.name, args.rank.map(RankArg::into_rank))?;
            emit_json(serde_json::to_value(&inferred).context("failed to serialize rank")?)
        }
    }
}

fn run_checklist(command: ChecklistCommand, api: &TaxonomyApi) -> Result<()> {
    match command {
        ChecklistCommand::Create(args) => {
            let metadata = ObservationMetadata {
                latitude: args.latitude,
                longitude: args.longitude,
                observed_on: args.observed_on,
                media_count: args.media_count,
                notes: args.notes,
                comment: args.comment,
            };
            if let Some(name) = args.name {
                let created = api
                    .create_observation(CreateObservationRequest {
                        name,
                        requested_rank: args.rank.map(RankArg::into_rank),
                        source: args.source,
                        user_id: args.user,
                        metadata,
                    })
                    .map_err(describe_taxonomy_error)?;
                return emit_json(
                    serde_json::to_value(&created).context("failed to serialize observation")?,
                );
            }

            let taxon_id =
                args.taxon_id.ok_or_else(|| anyhow!("either --taxon-id or --name is required"))?;
            let created = api.create_checklist_with_identification(CreateChecklistRequest {
                taxon_id,
                user_id: args.user,
                metadata,
            })?;
            emit_json(serde_json::to_value(&created).context("failed to serialize checklist")?)
        }
        ChecklistCommand::Show(args) => {
            let detail = api.checklist_detail(parse_checklist_id(&args.checklist_id)?)?;
            emit_json(serde_json::to_value(&detail).context("failed to serialize checklist")?)
        }
        ChecklistCommand::List(args) => {
            let checklists = api.list_checklists(&ChecklistFilter {
                user_id: args.user,
                grade: args.grade.map(GradeArg::into_grade),
                limit: args.limit,
            })?;
            emit_json(serde_json::json!({ "checklists": checklists }))
        }
        ChecklistCommand::Comment(args) => {
            let comment = api
                .add_comment(&AddCommentRequest {
                    checklist_id: parse_checklist_id(&args.checklist_id)?,
                    user_id: args.user,
                    body: args.body,
                })
                .map_err(describe_taxonomy_error)?;
            emit_json(serde_json::to_value(&comment).context("failed to serialize comment")?)
        }
        ChecklistCommand::Comments(args) => {
            let checklist_id = parse_checklist_id(&args.checklist_id)?;
            let comments = api.list_comments(checklist_id)?;
            emit_json(serde_json::json!({ "checklist_id": checklist_id, "comments": comments }))
        }
    }
}

fn run_identification(command: IdentificationCommand, api: &TaxonomyApi) -> Result<()> {
    let value = match command {
        IdentificationCommand::Add(args) => {
            let added = api.add_identification(AddIdentificationRequest {
                checklist_id: parse_checklist_id(&args.checklist_id)?,
                user_id: args.user,
                taxon_id: args.taxon_id,
                comment: args.comment,
            })?;
            serde_json::to_value(&added)
        }
        IdentificationCommand::Agree(args) => {
            let assessment =
                api.record_agreement(&args.into_event()?).map_err(describe_taxonomy_error)?;
            serde_json::to_value(&assessment)
        }
        IdentificationCommand::Disagree(args) => {
            let event = args.event.into_event()?;
            let assessment = api
                .record_disagreement(&DisagreeRequest {
                    checklist_id: event.checklist_id,
                    identification_id: event.identification_id,
                    user_id: event.user_id,
                    proposal: Disagreement {
                        taxon_id: args.taxon_id,
                        identification_level: args.level.map(|rank| rank.into_rank().level_str()),
                        comment: args.comment,
                    },
                })
                .map_err(describe_taxonomy_error)?;
            serde_json::to_value(&assessment)
        }
        IdentificationCommand::Withdraw(args) => {
            let assessment = api.withdraw(&args.into_event()?).map_err(describe_taxonomy_error)?;
            serde_json::to_value(&assessment)
        }
        IdentificationCommand::CancelAgreement(args) => {
            let assessment =
                api.cancel_agreement(&args.into_event()?).map_err(describe_taxonomy_error)?;
            serde_json::to_value(&assessment)
        }
    };
    emit_json(value.context("failed to serialize identification result")?)
}

fn run_assessment(command: AssessmentCommand, api: &TaxonomyApi) -> Result<()> {
    let value = match command {
        AssessmentCommand::Show(args) => {
            serde_json::to_value(api.assess_quality(parse_checklist_id(&args.checklist_id)?)?)
        }
        AssessmentCommand::VerifyLocation(args) => {
            serde_json::to_value(api.verify_location(&args.into_request()?)?)
        }
        AssessmentCommand::VoteWild(args) => {
            serde_json::to_value(api.vote_wild_status(&args.into_request()?)?)
        }
        AssessmentCommand::Improvement(args) => serde_json::to_value(
            api.update_improvement_status(
                parse_checklist_id(&args.checklist_id)?,
                args.can_be_improved,
            )?,
        ),
        AssessmentCommand::Evaluate(args) => {
            let mut flags = QualityFlags::all_set();
            for flag in &args.missing {
                flag.clear(&mut flags);
            }
            let grade =
                TaxonomyApi::evaluate(&flags, args.agreement_count, args.total_identifications);
            Ok(serde_json::json!({
                "flags": flags,
                "agreement_count": args.agreement_count,
                "total_identifications": args.total_identifications,
                "grade": grade
            }))
        }
    };
    emit_json(value.context("failed to serialize assessment")?)
}

/// Prefix domain errors with their kind so scripts can match on stderr.
fn describe_taxonomy_error(err: anyhow::Error) -> anyhow::Error {
    let kind = match err.downcast_ref::<TaxonomyError>() {
        Some(TaxonomyError::InvalidNameFormat(_)) => "invalid_name_format",
        Some(TaxonomyError::TaxaNotFound { .. }) => "taxa_not_found",
        Some(TaxonomyError::CollaboratorTimeout(_)) => "collaborator_timeout",
        Some(TaxonomyError::DuplicateAgreement { .. }) => "duplicate_agreement",
        Some(TaxonomyError::ConsistencyViolation(_)) => "consistency_violation",
        _ => return err,
    };
    err.context(format!("[{kind}]"))
}

impl IdentificationEventArgs {
    fn into_event(self) -> Result<IdentificationEvent> {
        Ok(IdentificationEvent {
            checklist_id: parse_checklist_id(&self.checklist_id)?,
            identification_id: parse_identification_id(&self.identification_id)?,
            user_id: self.user,
        })
    }
}

impl VoteArgs {
    fn into_request(self) -> Result<CommunityVoteRequest> {
        Ok(CommunityVoteRequest {
            checklist_id: parse_checklist_id(&self.checklist_id)?,
            user_id: self.user,
            verdict: self.verdict,
            comment: self.comment,
        })
    }
}

impl RankArg {
    fn into_rank(self) -> TaxonRank {
        match self {
            Self::Kingdom => TaxonRank::Kingdom,
            Self::Phylum => TaxonRank::Phylum,
            Self::Subphylum => TaxonRank::Subphylum,
            Self::Class => TaxonRank::Class,
            Self::Subclass => TaxonRank::Subclass,
            Self::Order => TaxonRank::Order,
            Self::Family => TaxonRank::Family,
            Self::Genus => TaxonRank::Genus,
            Self::Species => TaxonRank::Species,
            Self::Subspecies => TaxonRank::Subspecies,
            Self::Variety => TaxonRank::Variety,
            Self::Form => TaxonRank::Form,
            Self::Unknown => TaxonRank::Unknown,
        }
    }
}

impl StatusArg {
    fn into_status(self) -> TaxonomicStatus {
        match self {
            Self::Accepted => TaxonomicStatus::Accepted,
            Self::Synonym => TaxonomicStatus::Synonym,
            Self::Unknown => TaxonomicStatus::Unknown,
        }
    }
}

impl FlagArg {
    fn clear(self, flags: &mut QualityFlags) {
        match self {
            Self::HasDate => flags.has_date = false,
            Self::HasLocation => flags.has_location = false,
            Self::HasMedia => flags.has_media = false,
            Self::IsWild => flags.is_wild = false,
            Self::LocationAccurate => flags.location_accurate = false,
            Self::RecentEvidence => flags.recent_evidence = false,
            Self::RelatedEvidence => flags.related_evidence = false,
        }
    }
}

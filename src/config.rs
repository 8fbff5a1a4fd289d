//! Runtime configuration for one agent engine.
//!
//! Every tunable is readable from an environment variable whose name is the
//! published contract (tests rely on the defaults below). Optional
//! enrichment flags default off; the core toggles default on.

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Task-mode override for fanout planning. Safe Mode takes precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Focused,
    Balanced,
    Divergent,
    Methodical,
}

impl TaskMode {
    pub fn from_env() -> Option<Self> {
        match std::env::var("TASK_MODE").ok().as_deref() {
            Some("focused") => Some(TaskMode::Focused),
            Some("balanced") => Some(TaskMode::Balanced),
            Some("divergent") => Some(TaskMode::Divergent),
            Some("methodical") => Some(TaskMode::Methodical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub agent_id: String,
    pub kill_file: String,

    // Scheduler
    pub min_interval_ms: u64,
    pub max_interval_s: f64,
    pub dt_cap_s: f64,
    pub ema_beta: f64,

    // Decay (fast clock = activation, slow clock = weights)
    pub emact_decay_base: f64,
    pub emact_decay_min: f64,
    pub emact_decay_max: f64,
    pub weight_decay_base: f64,
    pub weight_decay_every_frames: u64,
    pub weight_floor: f64,
    pub weight_ceiling: f64,
    pub energy_floor: f64,
    pub consolidation_enabled: bool,
    pub consolidation_max: f64,
    pub resistance_enabled: bool,
    pub resistance_max: f64,

    // Threshold
    pub base_threshold: f64,
    pub criticality_factor: f64,
    pub affective_threshold_lambda_factor: f64,
    pub affect_threshold_enabled: bool,

    // Diffusion
    pub alpha_tick: f64,
    pub stride_budget: usize,

    // Criticality controller
    pub rho_target: f64,
    pub controller_kp: f64,
    pub controller_alpha_lever: bool,
    pub power_iteration_every_frames: u64,
    pub power_iteration_steps: usize,
    pub coherence_enabled: bool,

    // Fanout
    pub fanout_low: usize,
    pub fanout_high: usize,
    pub selective_topk: usize,
    pub min_topk: usize,
    pub wm_pressure_threshold: f64,
    pub fanout_task_mode_enabled: bool,
    pub task_mode: Option<TaskMode>,
    pub topk_split_enabled: bool,
    pub topk_split_temperature: f64,

    // Learning
    pub learning_rate_base: f64,
    pub overlay_cap: f64,
    pub trace_alpha_local: f64,
    pub trace_alpha_global: f64,
    pub ema_alpha: f64,
    pub trace_tau_s: f64,
    pub trace_drain_max: usize,
    pub strengthen_z_skip: f64,
    pub strengthen_affect_enabled: bool,
    pub strengthen_affect_kappa: f64,

    // Emotion gates
    pub emotion_gates_enabled: bool,
    pub res_lambda: f64,
    pub comp_lambda: f64,

    // Two-scale traversal
    pub two_scale_enabled: bool,
    pub hunger_weights: [f64; 5],
    pub hunger_softmax_sample: bool,

    // Working memory
    pub wm_token_budget: f64,
    pub wm_max_entities: usize,
    pub wm_top_members: usize,
    pub wm_diversity_bonus: f64,

    // Entity lifecycle
    pub entity_promote_quality: f64,
    pub entity_demote_quality: f64,
    pub entity_promote_streak: u64,
    pub entity_demote_streak: u64,
    pub entity_hysteresis: f64,

    // Tripwires / safe mode
    pub tripwire_conservation_epsilon: f64,
    pub tripwire_rho_low: f64,
    pub tripwire_rho_high: f64,
    pub tripwire_criticality_frames: u64,
    pub tripwire_frontier_pct: f64,
    pub tripwire_frontier_frames: u64,
    pub tripwire_missing_events_frames: u64,
    pub safe_mode_violation_threshold: usize,
    pub safe_mode_violation_window_s: f64,
    pub safe_mode_alpha_scale: f64,
    pub safe_mode_dt_cap_s: f64,

    // Telemetry
    pub telemetry_flush_interval_s: f64,
    pub telemetry_buffer_size: usize,
    pub stride_sample_rate: f64,

    // Bootstrap
    pub functional_entities_path: String,
    pub belongs_to_initial_weight: f64,
    pub semantic_cluster_iters: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            agent_id: env_str("AGENT_ID", "agent-0"),
            kill_file: env_str("KILL_FILE", "/tmp/STOP"),

            min_interval_ms: env_u64("MIN_INTERVAL_MS", 100),
            max_interval_s: env_f64("MAX_INTERVAL_S", 60.0),
            dt_cap_s: env_f64("DT_CAP_S", 5.0),
            ema_beta: env_f64("EMA_BETA", 0.3),

            emact_decay_base: env_f64("EMACT_DECAY_BASE", 2e-5),
            emact_decay_min: env_f64("EMACT_DECAY_MIN", 1e-6),
            emact_decay_max: env_f64("EMACT_DECAY_MAX", 1e-2),
            weight_decay_base: env_f64("WEIGHT_DECAY_BASE", 1e-6),
            weight_decay_every_frames: env_u64("WEIGHT_DECAY_EVERY_FRAMES", 60),
            weight_floor: env_f64("WEIGHT_FLOOR", -5.0),
            weight_ceiling: env_f64("WEIGHT_CEILING", 2.0),
            energy_floor: env_f64("ENERGY_FLOOR", 0.001),
            consolidation_enabled: env_flag("CONSOLIDATION_ENABLED", false),
            consolidation_max: env_f64("CONSOLIDATION_MAX", 0.8),
            resistance_enabled: env_flag("RESISTANCE_ENABLED", false),
            resistance_max: env_f64("RESISTANCE_MAX", 3.0),

            base_threshold: env_f64("BASE_THRESHOLD", 1.0),
            criticality_factor: env_f64("CRITICALITY_FACTOR", 2.0),
            affective_threshold_lambda_factor: env_f64("AFFECTIVE_THRESHOLD_LAMBDA_FACTOR", 0.08),
            affect_threshold_enabled: env_flag("AFFECT_THRESHOLD_ENABLED", false),

            alpha_tick: env_f64("ALPHA_TICK", 0.1),
            stride_budget: env_usize("STRIDE_BUDGET", 32),

            rho_target: env_f64("RHO_TARGET", 1.0),
            controller_kp: env_f64("CONTROLLER_KP", 0.1),
            controller_alpha_lever: env_flag("CONTROLLER_ALPHA_LEVER", false),
            power_iteration_every_frames: env_u64("POWER_ITER_EVERY_FRAMES", 10),
            power_iteration_steps: env_usize("POWER_ITER_STEPS", 20),
            coherence_enabled: env_flag("COHERENCE_ENABLED", false),

            fanout_low: env_usize("FANOUT_LOW", 3),
            fanout_high: env_usize("FANOUT_HIGH", 10),
            selective_topk: env_usize("SELECTIVE_TOPK", 5),
            min_topk: env_usize("MIN_TOPK", 2),
            wm_pressure_threshold: env_f64("WM_PRESSURE_THRESHOLD", 0.2),
            fanout_task_mode_enabled: env_flag("FANOUT_TASK_MODE_ENABLED", false),
            task_mode: TaskMode::from_env(),
            topk_split_enabled: env_flag("TOPK_SPLIT_ENABLED", false),
            topk_split_temperature: env_f64("TOPK_SPLIT_TEMPERATURE", 1.0),

            learning_rate_base: env_f64("LEARNING_RATE_BASE", 0.01),
            overlay_cap: env_f64("OVERLAY_CAP", 2.0),
            trace_alpha_local: env_f64("TRACE_ALPHA_LOCAL", 0.8),
            trace_alpha_global: env_f64("TRACE_ALPHA_GLOBAL", 0.2),
            ema_alpha: env_f64("EMA_ALPHA", 0.1),
            trace_tau_s: env_f64("TRACE_TAU_S", 86_400.0),
            trace_drain_max: env_usize("TRACE_DRAIN_MAX", 32),
            strengthen_z_skip: env_f64("STRENGTHEN_Z_SKIP", -1.0),
            strengthen_affect_enabled: env_flag("STRENGTHEN_AFFECT_ENABLED", false),
            strengthen_affect_kappa: env_f64("STRENGTHEN_AFFECT_KAPPA", 0.5),

            emotion_gates_enabled: env_flag("EMOTION_GATES_ENABLED", true),
            res_lambda: env_f64("RES_LAMBDA", 0.6),
            comp_lambda: env_f64("COMP_LAMBDA", 0.8),

            two_scale_enabled: env_flag("TWO_SCALE_ENABLED", true),
            hunger_weights: [
                env_f64("HUNGER_GOAL_FIT", 1.0),
                env_f64("HUNGER_INTEGRATION", 1.0),
                env_f64("HUNGER_COMPLETENESS", 1.0),
                env_f64("HUNGER_EASE", 1.0),
                env_f64("HUNGER_NOVELTY", 0.8),
            ],
            hunger_softmax_sample: env_flag("HUNGER_SOFTMAX_SAMPLE", false),

            wm_token_budget: env_f64("WM_TOKEN_BUDGET", 600.0),
            wm_max_entities: env_usize("WM_MAX_ENTITIES", 7),
            wm_top_members: env_usize("WM_TOP_MEMBERS", 5),
            wm_diversity_bonus: env_f64("WM_DIVERSITY_BONUS", 0.5),

            entity_promote_quality: env_f64("ENTITY_PROMOTE_QUALITY", 0.6),
            entity_demote_quality: env_f64("ENTITY_DEMOTE_QUALITY", 0.2),
            entity_promote_streak: env_u64("ENTITY_PROMOTE_STREAK", 30),
            entity_demote_streak: env_u64("ENTITY_DEMOTE_STREAK", 60),
            entity_hysteresis: env_f64("ENTITY_HYSTERESIS", 0.1),

            tripwire_conservation_epsilon: env_f64("TRIPWIRE_CONSERVATION_EPSILON", 1e-3),
            tripwire_rho_low: env_f64("TRIPWIRE_RHO_LOW", 0.7),
            tripwire_rho_high: env_f64("TRIPWIRE_RHO_HIGH", 1.3),
            tripwire_criticality_frames: env_u64("TRIPWIRE_CRITICALITY_FRAMES", 10),
            tripwire_frontier_pct: env_f64("TRIPWIRE_FRONTIER_PCT", 0.5),
            tripwire_frontier_frames: env_u64("TRIPWIRE_FRONTIER_FRAMES", 10),
            tripwire_missing_events_frames: env_u64("TRIPWIRE_MISSING_EVENTS_FRAMES", 5),
            safe_mode_violation_threshold: env_usize("SAFE_MODE_VIOLATION_THRESHOLD", 3),
            safe_mode_violation_window_s: env_f64("SAFE_MODE_VIOLATION_WINDOW_S", 60.0),
            safe_mode_alpha_scale: env_f64("SAFE_MODE_ALPHA_SCALE", 0.3),
            safe_mode_dt_cap_s: env_f64("SAFE_MODE_DT_CAP_S", 1.0),

            telemetry_flush_interval_s: env_f64("TELEMETRY_FLUSH_INTERVAL_S", 1.0),
            telemetry_buffer_size: env_usize("TELEMETRY_BUFFER_SIZE", 1024),
            stride_sample_rate: env_f64("STRIDE_SAMPLE_RATE", 0.1),

            functional_entities_path: env_str("FUNCTIONAL_ENTITIES_PATH", "config/functional_entities.yaml"),
            belongs_to_initial_weight: env_f64("BELONGS_TO_INITIAL_WEIGHT", 0.5),
            semantic_cluster_iters: env_usize("SEMANTIC_CLUSTER_ITERS", 12),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
